//! Configuration for the tunnel server.

use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Main configuration structure for the tunnel server.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Tunnel-side timing knobs.
///
/// `liveness_timeout_secs` must be a safe multiple of the agents' heartbeat
/// interval (default cadence is 15s, default timeout 45s = 3x) so that
/// ordinary jitter never looks like a dead agent.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// How long a fresh connection may take to send its registration frame.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Evict an agent whose last heartbeat is older than this.
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_secs: u64,
    /// Deadline applied to HTTP dispatches that do not specify one.
    #[serde(default = "default_dispatch_timeout_ms")]
    pub default_dispatch_timeout_ms: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout(),
            liveness_timeout_secs: default_liveness_timeout(),
            default_dispatch_timeout_ms: default_dispatch_timeout_ms(),
        }
    }
}

impl TunnelConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    /// Stale entries are swept at twice the eviction resolution.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs((self.liveness_timeout_secs / 2).max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_liveness_timeout() -> u64 {
    45
}
fn default_dispatch_timeout_ms() -> u64 {
    30_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (SERVER__SECTION__KEY format)
    /// 2. config.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("SERVER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
