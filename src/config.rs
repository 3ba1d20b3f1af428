//! Client configuration, loaded from TOML with every field defaulted.
//!
//! ```toml
//! [server]
//! ws_url = "ws://chat.internal:5001"
//! api_base = "http://chat.internal:5000"
//!
//! [reconnect]
//! base_delay_ms = 2000
//! max_attempts = 5
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

pub const ENV_WS_URL: &str = "HUDDLE_WS_URL";
pub const ENV_API_BASE: &str = "HUDDLE_API_BASE";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server: ServerConfig,
    pub reconnect: ReconnectConfig,
    pub typing: TypingConfig,
    pub heartbeat: HeartbeatConfig,
    pub generation: GenerationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub ws_url: String,
    pub api_base: String,
    pub private_chat_path: String,
    pub collaborative_chat_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:5001".to_string(),
            api_base: "http://127.0.0.1:5000".to_string(),
            private_chat_path: "/api/chat".to_string(),
            collaborative_chat_path: "/api/collaboration/chat".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypingConfig {
    /// How long a peer's typing indicator stays up after their last signal.
    pub expiry_ms: u64,
    /// Minimum gap between two outbound `typing` frames.
    pub throttle_ms: u64,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            expiry_ms: 3_000,
            throttle_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// 0 disables the heartbeat.
    pub interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_ms: 25_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 300,
        }
    }
}

impl ClientConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `HUDDLE_WS_URL` / `HUDDLE_API_BASE` when set and non-empty.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(url) = std::env::var(ENV_WS_URL).ok().filter(|v| !v.trim().is_empty()) {
            self.server.ws_url = url;
        }
        if let Some(base) = std::env::var(ENV_API_BASE).ok().filter(|v| !v.trim().is_empty()) {
            self.server.api_base = base;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.server.ws_url.starts_with("ws://") || self.server.ws_url.starts_with("wss://")) {
            return Err(ConfigError::Invalid {
                field: "server.ws_url",
                reason: format!("expected ws:// or wss:// URL, got '{}'", self.server.ws_url),
            });
        }
        if !(self.server.api_base.starts_with("http://") || self.server.api_base.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                field: "server.api_base",
                reason: format!("expected http:// or https:// URL, got '{}'", self.server.api_base),
            });
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "reconnect.base_delay_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "reconnect.max_attempts",
                reason: "must be at least 1".into(),
            });
        }
        if self.typing.expiry_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "typing.expiry_ms",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Full URL of the generation endpoint for a session kind.
    pub fn chat_url(&self, collaborative: bool) -> String {
        let path = if collaborative {
            &self.server.collaborative_chat_path
        } else {
            &self.server.private_chat_path
        };
        format!("{}{}", self.server.api_base.trim_end_matches('/'), path)
    }

    pub fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing.expiry_ms)
    }

    pub fn typing_throttle(&self) -> Duration {
        Duration::from_millis(self.typing.throttle_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat.interval_ms > 0).then(|| Duration::from_millis(self.heartbeat.interval_ms))
    }
}
