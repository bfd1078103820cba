//! Shared types: operation keys, outcomes, breaker states.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::ConfigError;
use crate::serde_duration;

/// Longest accepted operation key, in bytes.
pub const MAX_KEY_LEN: usize = 128;

lazy_static! {
    /// Keys look like `agent:workshop_3` or `llm/anthropic.complete`.
    static ref KEY_PATTERN: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:/-]*$").unwrap();
}

/// Identity of one breaker and one metrics series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OperationKey(String);

impl OperationKey {
    /// Validate and wrap a key.
    pub fn new(key: impl Into<String>) -> Result<Self, ConfigError> {
        let key = key.into();
        if key.is_empty() {
            return Err(ConfigError::InvalidKey {
                key,
                reason: "key must not be empty".to_string(),
            });
        }
        if key.len() > MAX_KEY_LEN {
            return Err(ConfigError::InvalidKey {
                key,
                reason: format!("key exceeds {} bytes", MAX_KEY_LEN),
            });
        }
        if !KEY_PATTERN.is_match(&key) {
            return Err(ConfigError::InvalidKey {
                key,
                reason: "allowed characters are A-Z a-z 0-9 _ . : / -".to_string(),
            });
        }
        Ok(Self(key))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OperationKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for OperationKey {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for OperationKey {
    type Error = ConfigError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<OperationKey> for String {
    fn from(key: OperationKey) -> Self {
        key.0
    }
}

impl AsRef<str> for OperationKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation
    Closed,

    /// Calls are rejected until the recovery timeout elapses
    Open,

    /// A single probe decides whether to close again
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an admission decision was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdmissionReason {
    /// Circuit closed, call proceeds normally
    Closed,

    /// Call admitted as the single recovery probe
    Probe,

    /// Circuit open and the recovery timeout has not elapsed
    Open,

    /// Another probe is already in flight
    HalfOpenBusy,
}

impl AdmissionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Probe => "probe",
            Self::Open => "open",
            Self::HalfOpenBusy => "half-open-busy",
        }
    }
}

impl fmt::Display for AdmissionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A breaker's answer to "may I run the primary now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admission {
    pub allowed: bool,
    pub reason: AdmissionReason,
}

impl Admission {
    pub(crate) fn allow(reason: AdmissionReason) -> Self {
        Self {
            allowed: true,
            reason,
        }
    }

    pub(crate) fn reject(reason: AdmissionReason) -> Self {
        Self {
            allowed: false,
            reason,
        }
    }

    /// Whether this admission is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.allowed && self.reason == AdmissionReason::Probe
    }
}

/// How a single execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    Failure,
    Timeout,
    /// The caller gave up; says nothing about the operation's health.
    Cancelled,
}

impl OutcomeKind {
    /// Whether this outcome should feed breakers and metrics.
    pub fn is_health_signal(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }

    /// Whether this outcome counts against the operation.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure | Self::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded execution result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// Operation the execution belongs to
    pub key: OperationKey,

    /// When the execution finished
    pub timestamp: DateTime<Utc>,

    /// How it ended
    pub kind: OutcomeKind,

    /// Wall time spent waiting for it
    #[serde(with = "serde_duration::millis", rename = "latency_ms")]
    pub latency: Duration,

    /// Error message for failures and timeouts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Free-form annotations (task type, workshop number, ...)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Outcome {
    /// Build an outcome with no error or metadata.
    pub fn new(key: OperationKey, kind: OutcomeKind, latency: Duration) -> Self {
        Self {
            key,
            timestamp: Utc::now(),
            kind,
            latency,
            error: None,
            metadata: HashMap::new(),
        }
    }

    pub fn succeeded(key: OperationKey, latency: Duration) -> Self {
        Self::new(key, OutcomeKind::Success, latency)
    }

    pub fn failed(key: OperationKey, latency: Duration, error: impl Into<String>) -> Self {
        Self::new(key, OutcomeKind::Failure, latency).with_error(error)
    }

    pub fn timed_out(key: OperationKey, timeout: Duration) -> Self {
        Self::new(key, OutcomeKind::Timeout, timeout)
            .with_error(format!("operation timed out after {:?}", timeout))
    }

    pub fn cancelled(key: OperationKey, latency: Duration) -> Self {
        Self::new(key, OutcomeKind::Cancelled, latency).with_error("caller cancelled")
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// True only for [`OutcomeKind::Success`].
    pub fn success(&self) -> bool {
        self.kind == OutcomeKind::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_key_validation() {
        assert!(OperationKey::new("agent:workshop_3").is_ok());
        assert!(OperationKey::new("llm/anthropic.complete-v2").is_ok());

        assert!(OperationKey::new("").is_err());
        assert!(OperationKey::new(":leading").is_err());
        assert!(OperationKey::new("has space").is_err());
        assert!(OperationKey::new("a".repeat(MAX_KEY_LEN + 1)).is_err());
    }

    #[test]
    fn test_operation_key_serde_validates() {
        let key: OperationKey = serde_json::from_str(r#""agent:docs""#).unwrap();
        assert_eq!(key.as_str(), "agent:docs");

        let bad: Result<OperationKey, _> = serde_json::from_str(r#""bad key""#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_outcome_kinds() {
        assert!(OutcomeKind::Timeout.is_failure());
        assert!(OutcomeKind::Failure.is_failure());
        assert!(!OutcomeKind::Cancelled.is_failure());
        assert!(!OutcomeKind::Cancelled.is_health_signal());
        assert!(OutcomeKind::Success.is_health_signal());
    }

    #[test]
    fn test_outcome_serializes_latency_in_millis() {
        let key = OperationKey::new("agent:docs").unwrap();
        let outcome = Outcome::failed(key, Duration::from_millis(42), "boom")
            .with_metadata("workshop", 3);

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["latency_ms"], 42);
        assert_eq!(json["kind"], "failure");
        assert_eq!(json["error"], "boom");
        assert_eq!(json["metadata"]["workshop"], 3);
        assert!(!outcome.success());
    }

    #[test]
    fn test_admission_reason_strings() {
        assert_eq!(AdmissionReason::HalfOpenBusy.to_string(), "half-open-busy");
        assert_eq!(AdmissionReason::Open.to_string(), "open");
    }
}
