//! Timeout-bounded execution.
//!
//! The operation is spawned as its own task. On timeout the wait is abandoned
//! and the task keeps running detached; whatever it eventually returns is
//! dropped. On caller cancellation the task is aborted.

use bulwark_core::{system_clock, Outcome, OperationKey, SharedClock};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::ExecError;

/// Runs one operation under a deadline and reports a timestamped [`Outcome`].
#[derive(Clone)]
pub struct BoundedExecutor {
    clock: SharedClock,
}

impl BoundedExecutor {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self { clock }
    }

    /// Run `operation`, racing it against `timeout` and `cancel`.
    ///
    /// Returns the value (or error) together with the outcome to record.
    /// A timed-out outcome carries `latency == timeout`.
    pub async fn run<F, Fut, T>(
        &self,
        key: &OperationKey,
        operation: F,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> (Result<T, ExecError>, Outcome)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let started = self.clock.now();

        if cancel.is_cancelled() {
            return (Err(ExecError::Cancelled), self.stamp(Outcome::cancelled(key.clone(), Duration::ZERO)));
        }

        let handle = tokio::spawn(operation());
        let abort = handle.abort_handle();

        let (result, outcome) = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                abort.abort();
                let latency = self.clock.now().saturating_duration_since(started);
                tracing::debug!(key = %key, latency = ?latency, "Caller cancelled operation");
                (Err(ExecError::Cancelled), Outcome::cancelled(key.clone(), latency))
            }

            joined = tokio::time::timeout(timeout, handle) => {
                let latency = self.clock.now().saturating_duration_since(started);
                match joined {
                    Ok(Ok(Ok(value))) => (Ok(value), Outcome::succeeded(key.clone(), latency)),
                    Ok(Ok(Err(e))) => {
                        tracing::warn!(key = %key, error = %e, "Operation failed");
                        let message = e.to_string();
                        (Err(ExecError::Failed(e)), Outcome::failed(key.clone(), latency, message))
                    }
                    Ok(Err(join_error)) => {
                        let message = if join_error.is_panic() {
                            "operation panicked".to_string()
                        } else {
                            join_error.to_string()
                        };
                        tracing::error!(key = %key, error = %message, "Operation task did not complete");
                        (Err(ExecError::Panicked(message.clone())), Outcome::failed(key.clone(), latency, message))
                    }
                    Err(_) => {
                        tracing::warn!(key = %key, timeout = ?timeout, "Operation timed out");
                        (Err(ExecError::Timeout(timeout)), Outcome::timed_out(key.clone(), timeout))
                    }
                }
            }
        };

        (result, self.stamp(outcome))
    }

    fn stamp(&self, outcome: Outcome) -> Outcome {
        outcome.with_timestamp(self.clock.utc_now())
    }
}

impl Default for BoundedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core::OutcomeKind;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn key() -> OperationKey {
        OperationKey::new("agent:docs").unwrap()
    }

    #[tokio::test]
    async fn test_success_reports_latency() {
        let executor = BoundedExecutor::new();
        let (result, outcome) = executor
            .run(
                &key(),
                || async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(42)
                },
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(outcome.kind, OutcomeKind::Success);
        assert!(outcome.latency >= Duration::from_millis(10));
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_failure_carries_message() {
        let executor = BoundedExecutor::new();
        let (result, outcome) = executor
            .run(
                &key(),
                || async { Err::<(), _>(anyhow::anyhow!("upstream refused")) },
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(ExecError::Failed(_))));
        assert_eq!(outcome.kind, OutcomeKind::Failure);
        assert_eq!(outcome.error.as_deref(), Some("upstream refused"));
    }

    #[tokio::test]
    async fn test_timeout_latency_equals_deadline() {
        let executor = BoundedExecutor::new();
        let timeout = Duration::from_millis(20);
        let (result, outcome) = executor
            .run(
                &key(),
                || async {
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    Ok(())
                },
                timeout,
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(ExecError::Timeout(t)) if t == timeout));
        assert_eq!(outcome.kind, OutcomeKind::Timeout);
        assert_eq!(outcome.latency, timeout);
    }

    #[tokio::test]
    async fn test_timed_out_task_keeps_running_detached() {
        let executor = BoundedExecutor::new();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        let (result, _) = executor
            .run(
                &key(),
                move || async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                },
                Duration::from_millis(5),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(ExecError::Timeout(_))));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_returns_promptly() {
        let executor = BoundedExecutor::new();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let (result, outcome) = executor
            .run(
                &key(),
                || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                },
                Duration::from_secs(10),
                &cancel,
            )
            .await;

        assert!(matches!(result, Err(ExecError::Cancelled)));
        assert_eq!(outcome.kind, OutcomeKind::Cancelled);
        assert!(outcome.latency < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_already_cancelled_never_starts() {
        let executor = BoundedExecutor::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = Arc::new(AtomicBool::new(false));
        let flag = started.clone();

        let (result, _) = executor
            .run(
                &key(),
                move || {
                    flag.store(true, Ordering::SeqCst);
                    async { Ok(()) }
                },
                Duration::from_secs(1),
                &cancel,
            )
            .await;

        assert!(matches!(result, Err(ExecError::Cancelled)));
        assert!(!started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panic_is_a_failure() {
        let executor = BoundedExecutor::new();
        let (result, outcome) = executor
            .run(
                &key(),
                || async {
                    if true {
                        panic!("boom");
                    }
                    Ok(())
                },
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(ExecError::Panicked(_))));
        assert_eq!(outcome.kind, OutcomeKind::Failure);
    }
}
