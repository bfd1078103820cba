//! Error taxonomy for bounded execution and fallback orchestration.

use bulwark_core::OperationKey;
use std::time::Duration;
use thiserror::Error;

use crate::invocation::FallbackReason;

/// How a bounded execution failed to produce a value.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation failed: {0}")]
    Failed(#[source] anyhow::Error),

    #[error("Operation panicked: {0}")]
    Panicked(String),

    #[error("Caller cancelled")]
    Cancelled,
}

/// Errors surfaced by the orchestrator.
///
/// `OperationTimeout` and `OperationFailure` are always recorded against the
/// breaker before they reach the caller. `CallerCancelled` never is.
#[derive(Error, Debug)]
pub enum InvokeError {
    #[error("Operation '{key}' timed out after {timeout:?}")]
    OperationTimeout { key: OperationKey, timeout: Duration },

    #[error("Operation '{key}' failed: {source}")]
    OperationFailure {
        key: OperationKey,
        #[source]
        source: anyhow::Error,
    },

    #[error("Circuit open for '{key}' and no fallback configured")]
    CircuitOpen { key: OperationKey },

    #[error("No fallback available for '{key}' ({reason})")]
    NoFallbackAvailable {
        key: OperationKey,
        reason: FallbackReason,
    },

    /// `source()` walks to the primary error when the primary ran; the
    /// fallback's own error is in the message and [`InvokeError::fallback_error`].
    #[error("Fallback for '{key}' failed ({reason}): {fallback}")]
    FallbackFailed {
        key: OperationKey,
        reason: FallbackReason,
        fallback: anyhow::Error,
        /// The primary error that sent us to the fallback, if the primary ran
        #[source]
        primary: Option<Box<InvokeError>>,
    },

    #[error("Caller cancelled '{key}'")]
    CallerCancelled { key: OperationKey },

    #[error("No handler registered for '{key}'")]
    UnknownOperation { key: OperationKey },
}

impl InvokeError {
    /// Map an executor error onto the caller-facing taxonomy.
    pub fn from_exec(key: &OperationKey, error: ExecError) -> Self {
        match error {
            ExecError::Timeout(timeout) => Self::OperationTimeout {
                key: key.clone(),
                timeout,
            },
            ExecError::Failed(source) => Self::OperationFailure {
                key: key.clone(),
                source,
            },
            ExecError::Panicked(message) => Self::OperationFailure {
                key: key.clone(),
                source: anyhow::anyhow!("operation panicked: {}", message),
            },
            ExecError::Cancelled => Self::CallerCancelled { key: key.clone() },
        }
    }

    pub fn key(&self) -> &OperationKey {
        match self {
            Self::OperationTimeout { key, .. }
            | Self::OperationFailure { key, .. }
            | Self::CircuitOpen { key }
            | Self::NoFallbackAvailable { key, .. }
            | Self::FallbackFailed { key, .. }
            | Self::CallerCancelled { key }
            | Self::UnknownOperation { key } => key,
        }
    }

    /// Whether the primary was attempted and its failure recorded.
    pub fn is_recorded_failure(&self) -> bool {
        match self {
            Self::OperationTimeout { .. } | Self::OperationFailure { .. } => true,
            Self::FallbackFailed { primary, .. } => primary.is_some(),
            _ => false,
        }
    }

    /// The error a failed fallback returned.
    pub fn fallback_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::FallbackFailed { fallback, .. } => Some(fallback),
            _ => None,
        }
    }

    /// The primary error wrapped by a failed fallback.
    pub fn primary_cause(&self) -> Option<&InvokeError> {
        match self {
            Self::FallbackFailed { primary, .. } => primary.as_deref(),
            _ => None,
        }
    }
}
