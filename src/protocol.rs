//! JSON messages exchanged with listener and trigger sockets.
//!
//! Listener → server: a version string, an avatar-selection text frame, then
//! batches of [`ListenerUpdate`]. Server → listener: [`ListenerCommand`].
//!
//! Trigger → server: a session token, then batches of trigger entries parsed
//! into [`TriggerMessage`]. Server → trigger: [`TriggerPush`].

use serde::{Deserialize, Deserializer, Serialize};

use crate::model::{Avatar, DataType, ParamValue, ParameterView};

/// Parameter name the dashboard uses to ask whether the listener is active.
pub const ACTIVITY_PARAMETER: &str = "chat-paramvr-activity";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("trigger entry {0} carries no request")]
    EmptyEntry(usize),
    #[error("trigger entry {0} carries more than one request")]
    AmbiguousEntry(usize),
}

// ── Listener ───────────────────────────────────────────────────────

/// One telemetry update: an OSC-style path and its raw value.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ListenerUpdate {
    pub name: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

pub fn parse_listener_updates(text: &str) -> Result<Vec<ListenerUpdate>, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// A change the listener should apply to its avatar.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterChange {
    pub name: String,
    pub value: String,
    pub data_type: DataType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPingBody {
    name: &'static str,
    value: &'static str,
    data_type: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ListenerCommand {
    Change(ParameterChange),
    AvatarChange {
        #[serde(rename = "vrcUuid")]
        vrc_uuid: String,
    },
    ActivityPing { parameter: ActivityPingBody },
}

impl ListenerCommand {
    pub fn activity_ping() -> Self {
        Self::ActivityPing {
            parameter: ActivityPingBody {
                name: ACTIVITY_PARAMETER,
                value: "",
                data_type: 0,
            },
        }
    }
}

// ── Trigger inbound ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParameterLock {
    pub name: String,
    pub locked: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChangeRequest {
    pub name: String,
    #[serde(deserialize_with = "scalar_as_string")]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AvatarChange {
    #[serde(rename = "vrcUuid")]
    pub vrc_uuid: String,
}

/// One entry of a trigger batch after validation.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerMessage {
    Lock(ParameterLock),
    Change(ChangeRequest),
    AvatarChange(AvatarChange),
    ActivityPing,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTriggerEntry {
    lock: Option<ParameterLock>,
    change: Option<ChangeRequest>,
    avatar_change: Option<AvatarChange>,
    #[serde(default)]
    ping: bool,
}

impl RawTriggerEntry {
    fn into_message(self, index: usize) -> Result<TriggerMessage, ProtocolError> {
        let mut found = Vec::with_capacity(1);
        if let Some(lock) = self.lock {
            found.push(TriggerMessage::Lock(lock));
        }
        if let Some(change) = self.change {
            if change.name == ACTIVITY_PARAMETER {
                found.push(TriggerMessage::ActivityPing);
            } else {
                found.push(TriggerMessage::Change(change));
            }
        }
        if let Some(avatar) = self.avatar_change {
            found.push(TriggerMessage::AvatarChange(avatar));
        }
        if self.ping {
            found.push(TriggerMessage::ActivityPing);
        }
        match found.len() {
            0 => Err(ProtocolError::EmptyEntry(index)),
            1 => Ok(found.remove(0)),
            _ => Err(ProtocolError::AmbiguousEntry(index)),
        }
    }
}

/// Parse a trigger batch. Every entry must carry exactly one request.
pub fn parse_trigger_batch(text: &str) -> Result<Vec<TriggerMessage>, ProtocolError> {
    let raw: Vec<RawTriggerEntry> = serde_json::from_str(text)?;
    raw.into_iter()
        .enumerate()
        .map(|(i, entry)| entry.into_message(i))
        .collect()
}

fn scalar_as_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    use serde::de::Error;
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        other => Err(D::Error::custom(format!("expected a scalar value, got {other}"))),
    }
}

// ── Trigger outbound ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvatarStatus {
    pub name: String,
    pub vrc_uuid: String,
    pub image: Option<String>,
    pub allow_change: bool,
    pub title: Option<String>,
}

impl From<&Avatar> for AvatarStatus {
    fn from(a: &Avatar) -> Self {
        Self {
            name: a.name.clone(),
            vrc_uuid: a.vrc_uuid.clone(),
            image: a.image.clone(),
            allow_change: a.allow_change,
            title: a.title.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Colors {
    pub color_primary: Option<String>,
    pub dark_mode_color_primary: Option<String>,
}

/// Everything a dashboard shows about the listener.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerStatus {
    pub avatar: Option<AvatarStatus>,
    pub is_pancake: Option<bool>,
    pub muted: Option<bool>,
    pub afk: Option<bool>,
    pub active: bool,
    pub vrc_open: Option<bool>,
    /// Milliseconds until the next avatar change is allowed, zero once the
    /// cooldown has elapsed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_change_cooldown: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub colors: Option<Colors>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TriggerPush {
    /// A single status field changed.
    Status {
        status: serde_json::Map<String, serde_json::Value>,
    },
    FullStatus {
        status: ListenerStatus,
    },
    Parameters {
        parameters: Vec<ParameterView>,
    },
    ParameterValue {
        name: String,
        value: ParamValue,
    },
    #[serde(rename_all = "camelCase")]
    ParameterLock {
        name: String,
        locked: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        lock_key: Option<String>,
    },
    ChangeableAvatars {
        avatars: Vec<AvatarStatus>,
    },
}

impl TriggerPush {
    pub fn status(key: &str, value: impl Into<serde_json::Value>) -> Self {
        let mut status = serde_json::Map::new();
        status.insert(key.to_string(), value.into());
        Self::Status { status }
    }
}
