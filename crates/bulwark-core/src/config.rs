//! Breaker and metrics configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::serde_duration;

/// Longest accepted recovery timeout. Keeps the reopen deadline well inside
/// the range of `Instant` arithmetic.
pub const MAX_RECOVERY_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Errors raised while building or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid operation key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(String),
}

impl ConfigError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Circuit breaker configuration.
///
/// Immutable once the breaker is built; a new config means a new breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failures in the closed state before opening
    pub failure_threshold: u32,

    /// Time the circuit stays open before a probe is admitted
    #[serde(with = "serde_duration::humane")]
    pub recovery_timeout: Duration,

    /// Hard limit for a single primary execution
    #[serde(with = "serde_duration::humane")]
    pub operation_timeout: Duration,

    /// Span of the rolling window used for the failure-rate check
    #[serde(with = "serde_duration::humane")]
    pub monitoring_window: Duration,

    /// Samples needed in the window before the failure rate can trip the circuit
    pub minimum_throughput: u32,

    /// Upper bound on samples kept in the breaker's window
    pub window_capacity: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            operation_timeout: Duration::from_secs(30),
            monitoring_window: Duration::from_secs(60),
            minimum_throughput: 10,
            window_capacity: 1000,
        }
    }
}

impl BreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_monitoring_window(mut self, window: Duration) -> Self {
        self.monitoring_window = window;
        self
    }

    pub fn with_minimum_throughput(mut self, samples: u32) -> Self {
        self.minimum_throughput = samples;
        self
    }

    pub fn with_window_capacity(mut self, capacity: usize) -> Self {
        self.window_capacity = capacity;
        self
    }

    /// Check the invariants a breaker relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold < 1 {
            return Err(ConfigError::invalid("failure_threshold", "must be at least 1"));
        }
        if self.recovery_timeout.is_zero() {
            return Err(ConfigError::invalid("recovery_timeout", "must be greater than zero"));
        }
        if self.recovery_timeout > MAX_RECOVERY_TIMEOUT {
            return Err(ConfigError::invalid("recovery_timeout", "must not exceed 365 days"));
        }
        if self.operation_timeout.is_zero() {
            return Err(ConfigError::invalid("operation_timeout", "must be greater than zero"));
        }
        if self.monitoring_window.is_zero() {
            return Err(ConfigError::invalid("monitoring_window", "must be greater than zero"));
        }
        if self.window_capacity == 0 {
            return Err(ConfigError::invalid("window_capacity", "must be at least 1"));
        }
        Ok(())
    }
}

/// Metrics store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Outcomes older than this are evicted
    #[serde(with = "serde_duration::humane")]
    pub retention: Duration,

    /// Per-key sample cap; bursts inside one window cannot grow past it
    pub max_samples: usize,

    /// Window used when a query does not name one
    #[serde(with = "serde_duration::humane")]
    pub default_window: Duration,

    /// How often the background pruner evicts aged samples
    #[serde(with = "serde_duration::humane")]
    pub prune_interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(60 * 60),
            max_samples: 10_000,
            default_window: Duration::from_secs(10 * 60),
            prune_interval: Duration::from_secs(60),
        }
    }
}

impl MetricsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retention.is_zero() {
            return Err(ConfigError::invalid("metrics.retention", "must be greater than zero"));
        }
        if self.max_samples == 0 {
            return Err(ConfigError::invalid("metrics.max_samples", "must be at least 1"));
        }
        if self.prune_interval.is_zero() {
            return Err(ConfigError::invalid("metrics.prune_interval", "must be greater than zero"));
        }
        if self.default_window > self.retention {
            return Err(ConfigError::invalid(
                "metrics.default_window",
                "must not exceed metrics.retention",
            ));
        }
        Ok(())
    }
}
