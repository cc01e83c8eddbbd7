use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::model::TargetUser;
use crate::protocol::AvatarStatus;
use crate::relay::TargetType;

use super::auth;
use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
    listeners: usize,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        listeners: state.relay.registry().listeners().len(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct TriggerConnectRequest {
    target: String,
    target_type: TargetType,
    #[serde(default)]
    client_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct TriggerConnectResponse {
    session_id: String,
    target_user: TargetUser,
    client_id: String,
    changeable_avatars: Option<Vec<AvatarStatus>>,
}

/// Mint a trigger session. The returned `sessionId` is the token the
/// dashboard presents on `/parameter-trigger`.
pub(super) async fn trigger_connect(
    State(state): State<AppState>,
    body: Result<Json<TriggerConnectRequest>, JsonRejection>,
) -> Result<Json<TriggerConnectResponse>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    if req.target.trim().is_empty() {
        return Err(ApiError::InvalidRequest("target must not be empty".into()));
    }
    let grant = state.relay.open_trigger_session(
        req.target.trim(),
        req.target_type,
        req.client_id.as_deref(),
    )?;
    Ok(Json(TriggerConnectResponse {
        session_id: grant.token,
        target_user: grant.target_user,
        client_id: grant.client_id,
        changeable_avatars: grant.changeable_avatars,
    }))
}

/// Clear every parameter lock on the caller's account.
pub(super) async fn emergency_unlock(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let (user_id, user) = auth::authenticate_listener(&state.relay, &headers)?;
    state.relay.force_unlock_all(user_id, &user)?;
    Ok(StatusCode::NO_CONTENT)
}
