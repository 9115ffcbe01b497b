//! Gateway configuration.

use crate::runtime::GatewayError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Configuration for the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Default environment variables for every call. A call's own `envs`
    /// take precedence.
    pub env: HashMap<String, String>,
    /// Whether to mount `GET /metrics`.
    pub enable_metrics: bool,
    /// Whether to mount `GET /routes`.
    pub enable_routes: bool,
    /// Maximum request body size in bytes.
    pub max_body_size: usize,
    /// Blocking functions allowed to run at once.
    pub max_blocking_workers: usize,
    /// Partial duration flush interval for long-lived calls, in seconds.
    pub metrics_flush_interval_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            env: HashMap::new(),
            enable_metrics: true,
            enable_routes: true,
            max_body_size: 10 * 1024 * 1024, // 10MB
            max_blocking_workers: default_workers(),
            metrics_flush_interval_secs: 5,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() + 4)
        .unwrap_or(8)
        .min(32)
}

impl GatewayConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the host address.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Add a default environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn enable_metrics(mut self, enabled: bool) -> Self {
        self.enable_metrics = enabled;
        self
    }

    pub fn enable_routes(mut self, enabled: bool) -> Self {
        self.enable_routes = enabled;
        self
    }

    pub fn max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = bytes;
        self
    }

    pub fn max_blocking_workers(mut self, workers: usize) -> Self {
        self.max_blocking_workers = workers.max(1);
        self
    }

    pub fn metrics_flush_interval(mut self, interval: Duration) -> Self {
        self.metrics_flush_interval_secs = interval.as_secs();
        self
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_flush_interval_secs)
    }

    /// Get the bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, GatewayError> {
        toml::from_str(s).map_err(|err| GatewayError::Config(err.to_string()))
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| GatewayError::Config(format!("{}: {}", path.display(), err)))?;
        debug!("Loaded gateway config from {}", path.display());
        Self::from_toml_str(&text)
    }

    /// Defaults, then the file named by `SERVEGATE_CONFIG`, then
    /// `SERVEGATE_HOST`, `SERVEGATE_PORT` and `SERVEGATE_MAX_BLOCKING_WORKERS`.
    pub fn from_env() -> Result<Self, GatewayError> {
        let config = match std::env::var("SERVEGATE_CONFIG") {
            Ok(path) => Self::load(path)?,
            Err(_) => Self::default(),
        };
        config.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, GatewayError> {
        if let Some(host) = lookup("SERVEGATE_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("SERVEGATE_PORT") {
            self.port = port
                .parse()
                .map_err(|_| GatewayError::Config(format!("invalid SERVEGATE_PORT: {}", port)))?;
        }
        if let Some(workers) = lookup("SERVEGATE_MAX_BLOCKING_WORKERS") {
            let workers: usize = workers.parse().map_err(|_| {
                GatewayError::Config(format!("invalid SERVEGATE_MAX_BLOCKING_WORKERS: {}", workers))
            })?;
            self.max_blocking_workers = workers.max(1);
        }
        Ok(self)
    }
}
