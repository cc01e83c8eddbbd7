//! Domain types shared by the store, the relay core, and the wire protocol.

use serde::{Deserialize, Serialize};

/// Normalized (lowercased) name of the account a connection observes or
/// controls. Every registry lookup keys on this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct TargetUser(String);

impl TargetUser {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TargetUser {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl From<TargetUser> for String {
    fn from(user: TargetUser) -> Self {
        user.0
    }
}

impl std::fmt::Display for TargetUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ── Parameter types ────────────────────────────────────────────────

/// Underlying value type of a parameter. Serialized as its numeric id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum DataType {
    Int = 1,
    Float = 2,
    Bool = 3,
}

impl TryFrom<u16> for DataType {
    type Error = String;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        match id {
            1 => Ok(Self::Int),
            2 => Ok(Self::Float),
            3 => Ok(Self::Bool),
            other => Err(format!("unknown data type id {other}")),
        }
    }
}

impl From<DataType> for u16 {
    fn from(dt: DataType) -> Self {
        dt as u16
    }
}

/// How a parameter is presented and driven from the dashboard. Serialized
/// as its numeric id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum ParameterType {
    /// Enumerated list of values.
    Lov = 1,
    Toggle = 2,
    Slider = 3,
    /// Pressed value that reverts to the default after `max_value` ms.
    Button = 4,
}

impl TryFrom<u16> for ParameterType {
    type Error = String;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        match id {
            1 => Ok(Self::Lov),
            2 => Ok(Self::Toggle),
            3 => Ok(Self::Slider),
            4 => Ok(Self::Button),
            other => Err(format!("unknown parameter type id {other}")),
        }
    }
}

impl From<ParameterType> for u16 {
    fn from(pt: ParameterType) -> Self {
        pt as u16
    }
}

/// A value observed on the listener, coerced to the parameter's data type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl ParamValue {
    /// Coerce a raw telemetry value to `data_type`. Numbers and finite
    /// numeric strings are accepted for numeric types, booleans and `"true"`/`"false"`
    /// for booleans. Anything else yields `None`.
    pub fn coerce(raw: &serde_json::Value, data_type: DataType) -> Option<Self> {
        use serde_json::Value;
        match (data_type, raw) {
            (DataType::Int, Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(Self::Int),
            (DataType::Int, Value::String(s)) => s.trim().parse().ok().map(Self::Int),
            (DataType::Float, Value::Number(n)) => n.as_f64().map(Self::Float),
            (DataType::Float, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Self::Float),
            (DataType::Bool, Value::Bool(b)) => Some(Self::Bool(*b)),
            (DataType::Bool, Value::String(s)) => match s.trim() {
                "true" => Some(Self::Bool(true)),
                "false" => Some(Self::Bool(false)),
                _ => None,
            },
            _ => None,
        }
    }

    /// Whether this value equals the textual `candidate` from a value list.
    pub fn matches(&self, candidate: &str) -> bool {
        let candidate = candidate.trim();
        match self {
            Self::Int(i) => candidate.parse::<i64>().map(|c| c == *i).unwrap_or(false),
            Self::Float(f) => candidate.parse::<f64>().map(|c| c == *f).unwrap_or(false),
            Self::Bool(b) => candidate.parse::<bool>().map(|c| c == *b).unwrap_or(false),
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// One entry of a parameter's enumerated value list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterValue {
    #[serde(default)]
    pub description: Option<String>,
    pub value: String,
    #[serde(default)]
    pub requires_invite: bool,
}

/// A parameter definition for one avatar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub kind: ParameterType,
    pub data_type: DataType,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub min_value: Option<String>,
    #[serde(default)]
    pub max_value: Option<String>,
    #[serde(default)]
    pub requires_invite: bool,
    #[serde(default = "default_saved")]
    pub saved: bool,
    #[serde(default)]
    pub lockable: bool,
    /// Client id holding the lock. Never serialized directly; see
    /// [`ParameterView`].
    #[serde(default, skip_serializing)]
    pub locked_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<ParameterValue>>,
}

fn default_saved() -> bool {
    true
}

impl Parameter {
    /// Whether `client_id` may change this parameter given its lock.
    pub fn lock_permits(&self, client_id: Option<&str>) -> bool {
        match &self.locked_by {
            None => true,
            Some(holder) => client_id == Some(holder.as_str()),
        }
    }

    /// Hold duration for BUTTON parameters.
    pub fn max_hold(&self) -> Option<std::time::Duration> {
        self.max_value
            .as_deref()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(std::time::Duration::from_millis)
    }
}

/// A parameter as shown to one trigger: values filtered to what it may see
/// and the lock holder redacted unless the trigger holds the lock itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterView {
    #[serde(flatten)]
    pub parameter: Parameter,
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_key: Option<String>,
}

// ── Avatars, invites, sessions ─────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Avatar {
    pub id: i64,
    pub vrc_uuid: String,
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub allow_change: bool,
    #[serde(default)]
    pub image: Option<String>,
}

/// Prefix every external avatar id carries.
pub const AVATAR_UUID_PREFIX: &str = "avtr_";

/// Minimal projection of an invite held in memory by a listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invite {
    pub id: i64,
    pub url: String,
    /// Expiry in epoch millis; `None` never expires.
    #[serde(default)]
    pub expires: Option<i64>,
    #[serde(default)]
    pub parameter_ids: Vec<i64>,
    #[serde(default)]
    pub changeable_avatar_ids: Vec<i64>,
}

impl Invite {
    pub fn grants_parameter(&self, parameter_id: i64) -> bool {
        self.parameter_ids.contains(&parameter_id)
    }

    pub fn grants_avatar(&self, avatar_id: i64) -> bool {
        self.changeable_avatar_ids.contains(&avatar_id)
    }
}

/// Look up an invite by id in a grant list. A missing id never matches.
pub fn find_invite(invites: &[Invite], id: Option<i64>) -> Option<&Invite> {
    let id = id?;
    invites.iter().find(|inv| inv.id == id)
}

/// A minted trigger session, resolved from the token a dashboard presents.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerSession {
    pub token: String,
    pub client_id: String,
    pub target_user: TargetUser,
    pub invite_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    /// Minimum seconds between two trigger-initiated avatar changes.
    #[serde(default)]
    pub avatar_change_cooldown: i64,
    #[serde(default)]
    pub color_primary: Option<String>,
    #[serde(default)]
    pub dark_mode_color_primary: Option<String>,
}
