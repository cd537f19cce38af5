//! Configuration for the tunnel agent.

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Main configuration structure for the tunnel agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AgentConfig {
    /// Authenticated user id. A `guest:<uuid>` identity is generated when
    /// absent.
    #[serde(default)]
    pub identity: Option<String>,
    /// Opaque locator advertised for the local runtime; defaults to the
    /// runtime base URL.
    #[serde(default)]
    pub endpoint_descriptor: Option<String>,
}

/// Tunnel connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// WebSocket URL of the backend tunnel endpoint.
    pub ws_url: String,
    /// Heartbeat cadence. The server's liveness timeout is a multiple of
    /// this; the defaults (15s cadence, 45s timeout) keep the 3x margin.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// First reconnect delay; doubles per failed attempt.
    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_secs: u64,
    /// Reconnect delay cap.
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_secs: u64,
    /// How long to wait for the registration acknowledgment.
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,
}

/// Local model runtime configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_runtime_url")]
    pub base_url: String,
    /// How often to poll the local model list; a change triggers a full
    /// re-registration.
    #[serde(default = "default_poll_interval")]
    pub models_poll_interval_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_url: default_runtime_url(),
            models_poll_interval_secs: default_poll_interval(),
        }
    }
}

// Default values
fn default_heartbeat_interval() -> u64 {
    15
}
fn default_reconnect_initial() -> u64 {
    1
}
fn default_reconnect_max() -> u64 {
    60
}
fn default_ack_timeout() -> u64 {
    10
}
fn default_runtime_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_poll_interval() -> u64 {
    30
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (AGENT__SECTION__KEY format)
    /// 2. config.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("AGENT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Locator advertised to the server for the local runtime.
    pub fn endpoint_descriptor(&self) -> String {
        self.agent
            .endpoint_descriptor
            .clone()
            .unwrap_or_else(|| self.runtime.base_url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_url(ws_url: &str) -> Config {
        Config {
            agent: AgentConfig::default(),
            tunnel: TunnelConfig {
                ws_url: ws_url.to_string(),
                heartbeat_interval_secs: default_heartbeat_interval(),
                reconnect_initial_secs: default_reconnect_initial(),
                reconnect_max_secs: default_reconnect_max(),
                ack_timeout_secs: default_ack_timeout(),
            },
            runtime: RuntimeConfig::default(),
        }
    }

    #[test]
    fn test_default_runtime_config() {
        let runtime = RuntimeConfig::default();
        assert_eq!(runtime.base_url, "http://localhost:11434");
        assert_eq!(runtime.models_poll_interval_secs, 30);
    }

    #[test]
    fn test_endpoint_descriptor_falls_back_to_runtime_url() {
        let config = config_with_url("ws://localhost:8080/ws/agents");
        assert_eq!(config.endpoint_descriptor(), "http://localhost:11434");

        let mut config = config_with_url("ws://localhost:8080/ws/agents");
        config.agent.endpoint_descriptor = Some("gpu-box".to_string());
        assert_eq!(config.endpoint_descriptor(), "gpu-box");
    }

    #[test]
    fn test_heartbeat_keeps_liveness_margin() {
        let config = config_with_url("ws://localhost:8080/ws/agents");
        // Server default liveness timeout is 45s; the default cadence must
        // fit three times into it.
        assert!(config.tunnel.heartbeat_interval_secs * 3 <= 45);
    }
}
