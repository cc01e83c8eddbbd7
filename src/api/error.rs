use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::relay::RelayError;

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 401 - No listener credentials provided.
    AuthRequired,
    /// 403 - Credentials provided but invalid.
    AuthInvalid,
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 400 - The requested user or invite does not exist.
    UnknownTarget(String),
    /// 400 - The target user already has the maximum number of sessions.
    TooManySessions,
    /// 503 - Storage is unreachable.
    StoreUnavailable,
}

impl ApiError {
    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            ApiError::AuthInvalid => StatusCode::FORBIDDEN,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::UnknownTarget(_) => StatusCode::BAD_REQUEST,
            ApiError::TooManySessions => StatusCode::BAD_REQUEST,
            ApiError::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthInvalid => "auth_invalid",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::UnknownTarget(_) => "unknown_target",
            ApiError::TooManySessions => "too_many_sessions",
            ApiError::StoreUnavailable => "store_unavailable",
        }
    }

    /// Returns a human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::AuthRequired => {
                "Authentication required. Provide listener credentials via Basic authorization.".to_string()
            }
            ApiError::AuthInvalid => "Invalid listener credentials.".to_string(),
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::UnknownTarget(target) => format!("No user or invite found for '{}'.", target),
            ApiError::TooManySessions => "Too many trigger sessions for this user.".to_string(),
            ApiError::StoreUnavailable => "Storage is unavailable. Try again shortly.".to_string(),
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::UnknownTarget(target) => ApiError::UnknownTarget(target),
            RelayError::TooManySessions(_) => ApiError::TooManySessions,
            RelayError::Store(e) => {
                tracing::error!(error = %e, "storage call failed");
                ApiError::StoreUnavailable
            }
            RelayError::Protocol(e) => ApiError::InvalidRequest(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
