use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::protocol::MAX_PAYLOAD_SIZE;

/// Server configuration, loaded from TOML.
///
/// Every field has a default, so an empty file (or no file) is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the listener binds to.
    pub bind: SocketAddr,
    /// Upper bound on a single wait for a new connection before the accept
    /// loop re-checks for shutdown.
    pub accept_poll_ms: u64,
    /// Close connections that have not joined within this many seconds.
    /// Unset means wait forever.
    pub join_timeout_secs: Option<u64>,
    /// Largest accepted frame payload, in bytes. Applies to received
    /// commands and to relayed messages; at most [`MAX_PAYLOAD_SIZE`].
    pub max_payload: u32,
    /// User-facing text overrides.
    pub messages: Catalog,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            accept_poll_ms: 1000,
            join_timeout_secs: None,
            max_payload: MAX_PAYLOAD_SIZE,
            messages: Catalog::default(),
        }
    }
}

impl ServerConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config = Self::from_toml_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.accept_poll_ms == 0 {
            return Err(ConfigError::Invalid("accept_poll_ms must be greater than 0".into()));
        }
        if self.max_payload == 0 {
            return Err(ConfigError::Invalid("max_payload must be greater than 0".into()));
        }
        // Clients decode with the wire maximum; a larger server limit would
        // relay frames they reject.
        if self.max_payload > MAX_PAYLOAD_SIZE {
            return Err(ConfigError::Invalid(format!(
                "max_payload must not exceed {MAX_PAYLOAD_SIZE} bytes"
            )));
        }
        Ok(())
    }

    pub fn accept_poll(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms)
    }

    pub fn join_timeout(&self) -> Option<Duration> {
        self.join_timeout_secs.map(Duration::from_secs)
    }
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(String),
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
            Self::Invalid(reason) => write!(f, "Invalid config: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}
