//! Configuration model.
//!
//! A single JSON document with optional sections; every field falls back to
//! a documented default so a minimal config is just the endpoint list:
//!
//! ```json
//! {
//!     "endpoints": [
//!         "https://rpc.example.org",
//!         "https://backup-rpc.example.org"
//!     ]
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Ingress bind options.
    #[serde(default)]
    pub server: ServerConfig,
    /// Upstream RPC endpoint URLs, in priority-tiebreak order.
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Rate-limit detection and cooldown tuning.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Per-endpoint worker tuning.
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Statistics persistence.
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Ingress bind options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind address. Default: 0.0.0.0
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port. Default: 8545 (the conventional Ethereum RPC port)
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Rate-limit detector tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Failure-rate signal threshold in [0, 1]. Default: 0.5
    #[serde(default = "default_detection_threshold")]
    pub detection_threshold: f64,
    /// Lower cooldown bound in milliseconds. Default: 60 000
    #[serde(default = "default_min_cooldown_ms")]
    pub min_cooldown_ms: u64,
    /// Upper cooldown bound in milliseconds. Default: 300 000
    #[serde(default = "default_max_cooldown_ms")]
    pub max_cooldown_ms: u64,
    /// Exponential backoff base. Default: 2
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Recent-request sample size for the failure-rate signal. Default: 20
    #[serde(default = "default_history_window_size")]
    pub history_window_size: usize,
}

/// Per-endpoint worker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Egress HTTP timeout in milliseconds. Default: 30 000
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Per-endpoint queue capacity. Default: 1000
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Interval between health probes of ERROR-state workers, in
    /// milliseconds. Default: 30 000
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Consecutive transport failures before a worker enters the ERROR
    /// state and waits for a health probe. Default: 3
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
}

/// Statistics persistence options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// SQLite database path. Default: ./data/statistics.db
    #[serde(default = "default_database_path")]
    pub path: String,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8545
}
fn default_detection_threshold() -> f64 {
    0.5
}
fn default_min_cooldown_ms() -> u64 {
    60_000
}
fn default_max_cooldown_ms() -> u64 {
    300_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_history_window_size() -> usize {
    20
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_max_queue_size() -> usize {
    1000
}
fn default_health_check_interval_ms() -> u64 {
    30_000
}
fn default_error_threshold() -> u32 {
    3
}
fn default_database_path() -> String {
    "./data/statistics.db".into()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            detection_threshold: default_detection_threshold(),
            min_cooldown_ms: default_min_cooldown_ms(),
            max_cooldown_ms: default_max_cooldown_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            history_window_size: default_history_window_size(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            max_queue_size: default_max_queue_size(),
            health_check_interval_ms: default_health_check_interval_ms(),
            error_threshold: default_error_threshold(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl WorkerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

impl Config {
    /// Load a configuration file, falling back to defaults for absent keys.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Validate that the configuration can actually run a proxy.
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(ProxyError::Config(
                "at least one upstream endpoint is required".into(),
            ));
        }
        for url in &self.endpoints {
            validate_http_url(url)?;
        }
        if !(0.0..=1.0).contains(&self.rate_limit.detection_threshold) {
            return Err(ProxyError::Config(format!(
                "rate_limit.detection_threshold must be within [0, 1], got {}",
                self.rate_limit.detection_threshold
            )));
        }
        if self.rate_limit.min_cooldown_ms > self.rate_limit.max_cooldown_ms {
            return Err(ProxyError::Config(format!(
                "rate_limit.min_cooldown_ms ({}) exceeds max_cooldown_ms ({})",
                self.rate_limit.min_cooldown_ms, self.rate_limit.max_cooldown_ms
            )));
        }
        if self.worker.max_queue_size == 0 {
            return Err(ProxyError::Config("worker.max_queue_size must be positive".into()));
        }
        Ok(())
    }
}

/// Validates that a URL string starts with http:// or https://
pub fn validate_http_url(url: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(ProxyError::Config(format!(
            "endpoint '{url}' must start with http:// or https://"
        )))
    }
}
