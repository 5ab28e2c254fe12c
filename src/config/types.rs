//! Configuration types and structures.

use crate::gateway::{DEFAULT_GATEWAY_URL, GatewayOptions};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default port for the REST API.
pub const DEFAULT_PORT: u16 = 31994;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Config {
    /// Load a single config file (YAML) without tier merging.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }
}

/// HTTP server and storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// JSON data file (default: ./mission-control/data.json).
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,

    /// Port for the REST API (default: 31994).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Initial retry delay in milliseconds when the server fails to bind (default: 15000).
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,

    /// Jitter range in milliseconds for retry delay (default: 5000, meaning ±5s).
    #[serde(default = "default_retry_jitter_ms")]
    pub retry_jitter_ms: u64,

    /// Maximum retry interval in milliseconds (default: 240000 = 4 minutes).
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Exponential backoff multiplier (default: 2.0).
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            port: default_port(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_jitter_ms: default_retry_jitter_ms(),
            retry_max_ms: default_retry_max_ms(),
            retry_multiplier: default_retry_multiplier(),
        }
    }
}

fn default_data_path() -> PathBuf {
    PathBuf::from("mission-control").join("data.json")
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_retry_initial_ms() -> u64 {
    15_000
}

fn default_retry_jitter_ms() -> u64 {
    5_000
}

fn default_retry_max_ms() -> u64 {
    240_000
}

fn default_retry_multiplier() -> f64 {
    2.0
}

/// Agent-runner gateway connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// When false, dispatch never contacts a runner.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_gateway_url")]
    pub url: String,

    /// Bearer token for the upgrade request.
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_gateway_url(),
            token: None,
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            ping_interval_ms: default_ping_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl GatewayConfig {
    /// Client options for this configuration.
    pub fn options(&self) -> GatewayOptions {
        GatewayOptions {
            url: self.url.clone(),
            token: self.token.clone().filter(|t| !t.is_empty()),
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            ping_interval: Duration::from_millis(self.ping_interval_ms.max(1)),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_gateway_url() -> String {
    DEFAULT_GATEWAY_URL.to_string()
}

fn default_reconnect_interval_ms() -> u64 {
    5_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_ping_interval_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}
