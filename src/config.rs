use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Relay configuration, loaded from TOML. Every field has a default so an
/// empty file (or no file at all) yields a working relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address the HTTP/WebSocket server binds to.
    pub bind: SocketAddr,
    /// Version string exchanged with listener clients during the handshake.
    pub protocol_version: String,
    /// Maximum concurrent trigger connections per target user.
    pub max_triggers_per_user: usize,
    /// Minimum gap between two accepted trigger frames.
    pub spam_interval_ms: u64,
    /// A listener counts as active if it reported activity within this window.
    pub activity_window_ms: i64,
    /// Minimum gap between activity pings forwarded to one listener.
    pub activity_ping_interval_ms: i64,
    /// Origins allowed by the CORS layer. Empty disables CORS.
    pub cors_origins: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            protocol_version: "0.3".to_string(),
            max_triggers_per_user: 25,
            spam_interval_ms: 75,
            activity_window_ms: 60_000,
            activity_ping_interval_ms: 30_000,
            cors_origins: Vec::new(),
        }
    }
}

impl RelayConfig {
    /// Load config from a TOML file path. Returns the defaults if the file
    /// doesn't exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    pub fn spam_interval(&self) -> Duration {
        Duration::from_millis(self.spam_interval_ms)
    }
}

/// Errors that can occur when loading config or fixture files.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
