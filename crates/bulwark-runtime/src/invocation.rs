//! Values passed into and out of an orchestrated call.

use bulwark_core::Outcome;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::flags::FlagContext;

/// A no-argument asynchronous operation producing `T`.
///
/// Primaries and fallbacks are both carried as `Operation`s so that an absent
/// fallback is simply `None`.
pub struct Operation<T> {
    inner: Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<T>> + Send>,
}

impl<T: Send + 'static> Operation<T> {
    pub fn new<F, Fut>(operation: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            inner: Box::new(move || operation().boxed()),
        }
    }

    /// Start the operation.
    pub fn call(self) -> BoxFuture<'static, anyhow::Result<T>> {
        (self.inner)()
    }
}

impl<T> fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Operation")
    }
}

/// Why the fallback was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackReason {
    FlagDisabled,
    CircuitOpen,
    PrimaryFailed,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FlagDisabled => "flag-disabled",
            Self::CircuitOpen => "circuit-open",
            Self::PrimaryFailed => "primary-failed",
        }
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which branch produced (or failed to produce) the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPath {
    Primary,
    FallbackAfterFailure,
    FallbackFlagDisabled,
    FallbackCircuitOpen,
}

impl ExecutionPath {
    pub fn is_fallback(&self) -> bool {
        !matches!(self, Self::Primary)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::FallbackAfterFailure => "fallback_after_failure",
            Self::FallbackFlagDisabled => "fallback_flag_disabled",
            Self::FallbackCircuitOpen => "fallback_circuit_open",
        }
    }
}

impl From<FallbackReason> for ExecutionPath {
    fn from(reason: FallbackReason) -> Self {
        match reason {
            FallbackReason::FlagDisabled => Self::FallbackFlagDisabled,
            FallbackReason::CircuitOpen => Self::FallbackCircuitOpen,
            FallbackReason::PrimaryFailed => Self::FallbackAfterFailure,
        }
    }
}

impl fmt::Display for ExecutionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call knobs for [`FallbackOrchestrator::invoke_with`](crate::FallbackOrchestrator::invoke_with).
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Caller cancellation; never counted as a failure
    pub cancel: CancellationToken,

    /// Attributes handed to the feature-flag gate
    pub flag_context: FlagContext,

    /// Overrides the key's configured operation timeout
    pub timeout: Option<Duration>,
}

impl InvokeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_flag_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.flag_context.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A successful orchestrated call.
#[derive(Debug, Clone)]
pub struct Invocation<T> {
    pub value: T,

    pub fallback_used: bool,

    pub path: ExecutionPath,

    /// Outcome of the primary attempt, `None` when the primary never ran
    pub primary_outcome: Option<Outcome>,
}

impl<T> Invocation<T> {
    pub fn into_value(self) -> T {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_operation_runs_once() {
        let op = Operation::new(|| async { Ok::<_, anyhow::Error>(7) });
        assert_eq!(op.call().await.unwrap(), 7);
    }

    #[test]
    fn test_reason_maps_to_path() {
        assert_eq!(ExecutionPath::from(FallbackReason::CircuitOpen), ExecutionPath::FallbackCircuitOpen);
        assert_eq!(ExecutionPath::from(FallbackReason::PrimaryFailed), ExecutionPath::FallbackAfterFailure);
        assert!(ExecutionPath::FallbackFlagDisabled.is_fallback());
        assert!(!ExecutionPath::Primary.is_fallback());
    }

    #[test]
    fn test_path_serializes_snake_case() {
        let json = serde_json::to_string(&ExecutionPath::FallbackCircuitOpen).unwrap();
        assert_eq!(json, "\"fallback_circuit_open\"");
        assert_eq!(FallbackReason::FlagDisabled.to_string(), "flag-disabled");
    }

    #[test]
    fn test_options_builder() {
        let options = InvokeOptions::new()
            .with_timeout(Duration::from_millis(5))
            .with_flag_context("user", "u-1");
        assert_eq!(options.timeout, Some(Duration::from_millis(5)));
        assert_eq!(options.flag_context["user"], serde_json::json!("u-1"));
        assert!(!options.cancel.is_cancelled());
    }
}
