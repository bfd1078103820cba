//! Keyed operation handlers.

use async_trait::async_trait;
use bulwark_core::OperationKey;
use std::time::Duration;

/// An operation registered with the orchestrator under a fixed key.
///
/// Handlers take and return JSON so that heterogeneous operations share one
/// dispatch table. Typed callers use
/// [`FallbackOrchestrator::invoke`](crate::FallbackOrchestrator::invoke)
/// directly instead.
///
/// # Cancellation
/// `execute` may be dropped at any await point (timeout or caller
/// cancellation) and must leave no half-applied state behind.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// The key this handler answers for.
    fn key(&self) -> &OperationKey;

    /// The primary path.
    async fn execute(&self, input: serde_json::Value) -> anyhow::Result<serde_json::Value>;

    /// Whether [`fallback`](Self::fallback) should be offered to the orchestrator.
    fn has_fallback(&self) -> bool {
        false
    }

    /// The degraded path, used when the primary is gated off, short-circuited or fails.
    async fn fallback(&self, _input: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        Err(anyhow::anyhow!("no fallback for '{}'", self.key()))
    }

    /// Overrides the breaker config's operation timeout.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo {
        key: OperationKey,
    }

    #[async_trait]
    impl OperationHandler for Echo {
        fn key(&self) -> &OperationKey {
            &self.key
        }

        async fn execute(&self, input: serde_json::Value) -> anyhow::Result<serde_json::Value> {
            Ok(input)
        }
    }

    #[tokio::test]
    async fn test_defaults() {
        let echo = Echo {
            key: OperationKey::new("echo").unwrap(),
        };

        assert_eq!(echo.execute(json!({"a": 1})).await.unwrap(), json!({"a": 1}));
        assert!(!echo.has_fallback());
        assert!(echo.timeout().is_none());
        let error = echo.fallback(json!(null)).await.unwrap_err();
        assert!(error.to_string().contains("echo"));
    }
}
