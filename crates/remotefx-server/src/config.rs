//! Server configuration.

use crate::error::{Result, ServerError};
use crate::recents::DEFAULT_NUM_RECENTS;
use remotefx_protocol::DEFAULT_SERVER_PORT;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Server settings. Every field has a default, so a config file only needs
/// the keys it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,

    /// The listening port is `base_port + server_id`.
    pub base_port: u16,
    pub server_id: u16,

    pub screen_capture_interval_ms: u64,
    pub screen_diff_detection: bool,

    /// Poll interval for reads on session streams.
    pub read_timeout_ms: u64,

    pub num_recents: usize,

    /// Plugin identifiers hidden from the plugin list.
    pub exclude_plugins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            base_port: DEFAULT_SERVER_PORT,
            server_id: 0,
            screen_capture_interval_ms: 50,
            screen_diff_detection: true,
            read_timeout_ms: 1000,
            num_recents: DEFAULT_NUM_RECENTS,
            exclude_plugins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load from a JSON file, or defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("reading {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| ServerError::Config(format!("parsing {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(ServerError::Config("host is empty".into()));
        }
        if self.port().is_none() {
            return Err(ServerError::Config(format!(
                "base_port {} + server_id {} overflows",
                self.base_port, self.server_id
            )));
        }
        if self.screen_capture_interval_ms == 0 {
            return Err(ServerError::Config(
                "screen_capture_interval_ms must be non-zero".into(),
            ));
        }
        if self.read_timeout_ms == 0 {
            return Err(ServerError::Config("read_timeout_ms must be non-zero".into()));
        }
        if self.num_recents == 0 {
            return Err(ServerError::Config("num_recents must be non-zero".into()));
        }
        Ok(())
    }

    pub fn port(&self) -> Option<u16> {
        self.base_port.checked_add(self.server_id)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port().unwrap_or(self.base_port))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.screen_capture_interval_ms)
    }

    pub fn is_excluded(&self, identifier: &str) -> bool {
        self.exclude_plugins.iter().any(|e| e == identifier)
    }
}
