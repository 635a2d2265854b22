use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::defaults;
use crate::error::ProxyError;

/// Proxy configuration
///
/// Serde-friendly so hosts can load it from a file or the environment;
/// `with_*` methods override single values on top of the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address the application listener binds to
    pub listen_addr: String,

    /// Maximum number of concurrent application connections
    pub max_connections: usize,

    /// Per-call timeout, counted from when the call is forwarded (milliseconds)
    pub call_timeout_ms: u64,

    /// Period of the maintenance timer (milliseconds)
    pub sweep_interval_ms: u64,

    /// How long disconnected application records stay visible to diagnostics (seconds)
    pub disconnected_retention_secs: u64,

    /// Bound on graceful shutdown (milliseconds)
    pub shutdown_timeout_ms: u64,

    /// Maximum length of one framed line (bytes)
    pub max_frame_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: defaults::DEFAULT_LISTEN_ADDR.to_string(),
            max_connections: defaults::DEFAULT_MAX_CONNECTIONS,
            call_timeout_ms: defaults::DEFAULT_CALL_TIMEOUT_MS,
            sweep_interval_ms: defaults::DEFAULT_SWEEP_INTERVAL_MS,
            disconnected_retention_secs: defaults::DEFAULT_DISCONNECTED_RETENTION_SECS,
            shutdown_timeout_ms: defaults::DEFAULT_SHUTDOWN_TIMEOUT_MS,
            max_frame_bytes: defaults::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ProxyConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = duration_millis(timeout);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = duration_millis(interval);
        self
    }

    pub fn with_disconnected_retention(mut self, retention: Duration) -> Self {
        self.disconnected_retention_secs = retention.as_secs();
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = duration_millis(timeout);
        self
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn disconnected_retention(&self) -> Duration {
        Duration::from_secs(self.disconnected_retention_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.listen_addr.trim().is_empty() {
            return Err(ProxyError::InvalidConfig(
                "listen address must not be empty".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ProxyError::InvalidConfig(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.call_timeout_ms == 0 {
            return Err(ProxyError::InvalidConfig(
                "call timeout must be greater than zero".to_string(),
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ProxyError::InvalidConfig(
                "sweep interval must be greater than zero".to_string(),
            ));
        }
        if self.max_frame_bytes < 64 {
            return Err(ProxyError::InvalidConfig(
                "max_frame_bytes must be at least 64".to_string(),
            ));
        }
        Ok(())
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
