use axum::http::{header, HeaderMap};
use base64::Engine;

use super::error::ApiError;
use crate::model::TargetUser;
use crate::relay::Relay;

/// User name and listen key from a Basic authorization header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub user: String,
    pub listen_key: String,
}

/// Decode `Authorization: Basic <base64(user:key)>`.
pub fn extract_basic(headers: &HeaderMap) -> Option<BasicCredentials> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, listen_key) = decoded.split_once(':')?;
    Some(BasicCredentials {
        user: user.to_string(),
        listen_key: listen_key.to_string(),
    })
}

/// Check listener credentials against the store. Returns the user id and
/// normalized user name.
pub fn authenticate_listener(
    relay: &Relay,
    headers: &HeaderMap,
) -> Result<(i64, TargetUser), ApiError> {
    let creds = extract_basic(headers).ok_or(ApiError::AuthRequired)?;
    let user = TargetUser::new(&creds.user);
    match relay.store().authenticate_listener(&user, &creds.listen_key) {
        Ok(Some(user_id)) => Ok((user_id, user)),
        Ok(None) => {
            tracing::debug!(target_user = %user, "listener credentials rejected");
            Err(ApiError::AuthInvalid)
        }
        Err(e) => {
            tracing::error!(error = %e, target_user = %user, "failed to authenticate listener");
            Err(ApiError::StoreUnavailable)
        }
    }
}
