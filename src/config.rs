//! Replica configuration

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::convergent::DEFAULT_MAX_PENDING;
use crate::sync::{SessionConfig, DEFAULT_MAX_FRAME};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Settings for one replica process. Missing fields take their defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    /// Base URL of the identity service
    pub identity_url: String,
    /// Where the peer binary listens for links
    pub listen_addr: SocketAddr,
    /// Deferred changes held per document before the oldest is discarded
    pub max_pending_per_document: usize,
    /// How long a session may negotiate before it is reported stuck
    pub stuck_after_ms: u64,
    /// Largest accepted wire frame
    pub max_frame_bytes: usize,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            identity_url: "http://127.0.0.1:4000".to_string(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_pending_per_document: DEFAULT_MAX_PENDING,
            stuck_after_ms: 10_000,
            max_frame_bytes: DEFAULT_MAX_FRAME,
        }
    }
}

impl ReplicaConfig {
    /// Load from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        serde_json::from_slice(&data).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn stuck_after(&self) -> Duration {
        Duration::from_millis(self.stuck_after_ms)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            stuck_after: self.stuck_after(),
            max_frame: self.max_frame_bytes,
        }
    }
}
