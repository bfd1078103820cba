//! Fallback orchestration.
//!
//! Each call walks the same decision path:
//! 1. Feature flag off: run the fallback; the breaker is never consulted
//! 2. Breaker rejects: run the fallback without touching the primary
//! 3. Otherwise run the primary under its timeout and record the outcome
//! 4. Primary failed or timed out: run the fallback
//!
//! Outcomes reach the breaker and the metrics store before the caller sees
//! the result. Caller cancellation is never recorded as a failure.

use bulwark_core::{
    system_clock, BreakerRegistry, BreakerState, ConfigError, MetricsStore, OperationKey, Outcome,
    OutcomeKind, SharedClock,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::config::RuntimeConfig;
use crate::error::{ExecError, InvokeError};
use crate::executor::BoundedExecutor;
use crate::flags::FeatureFlagGate;
use crate::handler::OperationHandler;
use crate::invocation::{ExecutionPath, FallbackReason, Invocation, InvokeOptions, Operation};
use crate::sink::{EventSink, ResilienceEvent, TracingSink};
use crate::status::StatusBoard;

/// Half-open trial slot held while the admitted call runs.
///
/// Dropping it armed hands the slot back to the breaker, so a caller that
/// abandons the call future mid-trial does not leave the key stuck half-open.
struct TrialSlot<'a> {
    registry: &'a BreakerRegistry,
    key: &'a OperationKey,
    armed: bool,
}

impl TrialSlot<'_> {
    /// The outcome reached the breaker; nothing to hand back.
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(key = %self.key, "Half-open trial abandoned, releasing slot");
            self.registry.release_probe(self.key);
        }
    }
}

/// Runs primaries behind a flag gate and a circuit breaker, falling back
/// when either says no or the primary fails.
pub struct FallbackOrchestrator {
    registry: Arc<BreakerRegistry>,

    metrics: Arc<MetricsStore>,

    flags: Arc<dyn FeatureFlagGate>,

    sink: Arc<dyn EventSink>,

    executor: BoundedExecutor,

    /// Dispatch table, fixed at construction
    handlers: HashMap<OperationKey, Arc<dyn OperationHandler>>,

    clock: SharedClock,
}

impl FallbackOrchestrator {
    pub fn builder() -> FallbackOrchestratorBuilder {
        FallbackOrchestratorBuilder::new()
    }

    pub fn registry(&self) -> &Arc<BreakerRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsStore> {
        &self.metrics
    }

    pub fn status_board(&self) -> StatusBoard {
        StatusBoard::new(self.registry.clone(), self.metrics.clone())
    }

    /// Close the breaker for `key` and drop its recorded outcomes.
    pub fn reset(&self, key: &OperationKey) {
        self.registry.reset(key);
        self.metrics.reset(key);
        tracing::info!(key = %key, "Operation reset");
    }

    /// Keys with a registered handler, sorted.
    pub fn handler_keys(&self) -> Vec<OperationKey> {
        let mut keys: Vec<OperationKey> = self.handlers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Run `primary` for `key`, using `fallback` when the primary is gated
    /// off, short-circuited or fails.
    pub async fn invoke<T: Send + 'static>(
        &self,
        key: &OperationKey,
        primary: Operation<T>,
        fallback: Option<Operation<T>>,
    ) -> Result<Invocation<T>, InvokeError> {
        self.invoke_with(key, primary, fallback, InvokeOptions::default()).await
    }

    /// [`invoke`](Self::invoke) with a cancellation token, flag context and
    /// timeout override.
    pub async fn invoke_with<T: Send + 'static>(
        &self,
        key: &OperationKey,
        primary: Operation<T>,
        fallback: Option<Operation<T>>,
        options: InvokeOptions,
    ) -> Result<Invocation<T>, InvokeError> {
        let started = self.clock.now();

        if !self.flags.is_enabled(key, &options.flag_context) {
            tracing::debug!(key = %key, "Primary disabled by feature flag");
            return self
                .run_fallback(key, fallback, FallbackReason::FlagDisabled, None, &options, started)
                .await;
        }

        let admission = self.registry.admit(key);
        if !admission.allowed {
            tracing::warn!(key = %key, reason = %admission.reason, "Circuit open, short-circuiting primary");
            return self
                .run_fallback(key, fallback, FallbackReason::CircuitOpen, None, &options, started)
                .await;
        }
        let trial = admission.is_probe().then(|| {
            tracing::info!(key = %key, "Running half-open probe");
            TrialSlot {
                registry: &self.registry,
                key,
                armed: true,
            }
        });

        let timeout = options
            .timeout
            .unwrap_or_else(|| self.registry.config_for(key).operation_timeout);

        let (result, outcome) = self
            .executor
            .run(key, move || primary.call(), timeout, &options.cancel)
            .await;
        self.record(&outcome);
        if let Some(trial) = trial {
            trial.disarm();
        }

        match result {
            Ok(value) => {
                self.emit(ResilienceEvent {
                    outcome: Some(outcome.kind),
                    succeeded: true,
                    ..self.event(key, ExecutionPath::Primary, started)
                });
                Ok(Invocation {
                    value,
                    fallback_used: false,
                    path: ExecutionPath::Primary,
                    primary_outcome: Some(outcome),
                })
            }
            Err(ExecError::Cancelled) => {
                self.emit(ResilienceEvent {
                    outcome: Some(outcome.kind),
                    ..self.event(key, ExecutionPath::Primary, started)
                });
                Err(InvokeError::CallerCancelled { key: key.clone() })
            }
            Err(error) => {
                let primary_error = InvokeError::from_exec(key, error);
                self.run_fallback(
                    key,
                    fallback,
                    FallbackReason::PrimaryFailed,
                    Some((primary_error, outcome)),
                    &options,
                    started,
                )
                .await
            }
        }
    }

    /// Invoke the handler registered for `key`.
    pub async fn dispatch(
        &self,
        key: &OperationKey,
        input: serde_json::Value,
    ) -> Result<Invocation<serde_json::Value>, InvokeError> {
        self.dispatch_with(key, input, InvokeOptions::default()).await
    }

    pub async fn dispatch_with(
        &self,
        key: &OperationKey,
        input: serde_json::Value,
        mut options: InvokeOptions,
    ) -> Result<Invocation<serde_json::Value>, InvokeError> {
        let handler = self
            .handlers
            .get(key)
            .cloned()
            .ok_or_else(|| InvokeError::UnknownOperation { key: key.clone() })?;

        if options.timeout.is_none() {
            options.timeout = handler.timeout();
        }

        let primary = {
            let handler = handler.clone();
            let input = input.clone();
            Operation::new(move || async move { handler.execute(input).await })
        };
        let fallback = handler.has_fallback().then(|| {
            let handler = handler.clone();
            Operation::new(move || async move { handler.fallback(input).await })
        });

        self.invoke_with(key, primary, fallback, options).await
    }

    /// Feed a primary outcome to the breaker and the store.
    fn record(&self, outcome: &Outcome) {
        match outcome.kind {
            OutcomeKind::Success => self.registry.record_success(&outcome.key),
            OutcomeKind::Failure | OutcomeKind::Timeout => {
                let error = outcome.error.as_deref().unwrap_or(outcome.kind.as_str());
                self.registry.record_failure(&outcome.key, error);
            }
            OutcomeKind::Cancelled => {
                self.registry.release_probe(&outcome.key);
                return;
            }
        }
        self.metrics.record(outcome.clone());
    }

    async fn run_fallback<T: Send + 'static>(
        &self,
        key: &OperationKey,
        fallback: Option<Operation<T>>,
        reason: FallbackReason,
        primary: Option<(InvokeError, Outcome)>,
        options: &InvokeOptions,
        started: Instant,
    ) -> Result<Invocation<T>, InvokeError> {
        let (primary_error, primary_outcome) = match primary {
            Some((error, outcome)) => (Some(error), Some(outcome)),
            None => (None, None),
        };
        let path = match reason {
            FallbackReason::PrimaryFailed => ExecutionPath::Primary,
            other => ExecutionPath::from(other),
        };
        let base = ResilienceEvent {
            outcome: primary_outcome.as_ref().map(|o| o.kind),
            ..self.event(key, path, started)
        };

        let Some(fallback) = fallback else {
            self.emit(base);
            return Err(match (primary_error, reason) {
                (Some(error), _) => error,
                (None, FallbackReason::CircuitOpen) => InvokeError::CircuitOpen { key: key.clone() },
                (None, reason) => InvokeError::NoFallbackAvailable {
                    key: key.clone(),
                    reason,
                },
            });
        };

        let path = ExecutionPath::from(reason);
        tracing::info!(key = %key, reason = %reason, "Running fallback");

        let finished = tokio::select! {
            biased;
            _ = options.cancel.cancelled() => None,
            result = fallback.call() => Some(result),
        };
        let Some(result) = finished else {
            self.emit(ResilienceEvent { path, ..base });
            return Err(InvokeError::CallerCancelled { key: key.clone() });
        };

        match result {
            Ok(value) => {
                self.emit(ResilienceEvent {
                    path,
                    fallback_used: true,
                    succeeded: true,
                    latency: self.clock.now().saturating_duration_since(started),
                    ..base
                });
                Ok(Invocation {
                    value,
                    fallback_used: true,
                    path,
                    primary_outcome,
                })
            }
            Err(fallback_error) => {
                tracing::warn!(key = %key, reason = %reason, error = %fallback_error, "Fallback failed");
                self.emit(ResilienceEvent {
                    path,
                    fallback_used: true,
                    latency: self.clock.now().saturating_duration_since(started),
                    ..base
                });
                Err(InvokeError::FallbackFailed {
                    key: key.clone(),
                    reason,
                    fallback: fallback_error,
                    primary: primary_error.map(Box::new),
                })
            }
        }
    }

    fn event(&self, key: &OperationKey, path: ExecutionPath, started: Instant) -> ResilienceEvent {
        ResilienceEvent {
            operation: key.clone(),
            outcome: None,
            latency: self.clock.now().saturating_duration_since(started),
            breaker_state: self
                .registry
                .get(key)
                .map(|b| b.state())
                .unwrap_or(BreakerState::Closed),
            fallback_used: false,
            path,
            succeeded: false,
            timestamp: self.clock.utc_now(),
        }
    }

    fn emit(&self, event: ResilienceEvent) {
        self.sink.record(event);
    }
}

/// Builder for [`FallbackOrchestrator`].
///
/// Anything not supplied is built from the [`RuntimeConfig`] (default config
/// if none is set). The default gate comes from `config.flags`, the default
/// sink is [`TracingSink`].
pub struct FallbackOrchestratorBuilder {
    config: RuntimeConfig,
    registry: Option<Arc<BreakerRegistry>>,
    metrics: Option<Arc<MetricsStore>>,
    flags: Option<Arc<dyn FeatureFlagGate>>,
    sink: Option<Arc<dyn EventSink>>,
    clock: Option<SharedClock>,
    handlers: Vec<Arc<dyn OperationHandler>>,
}

impl FallbackOrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            registry: None,
            metrics: None,
            flags: None,
            sink: None,
            clock: None,
            handlers: Vec::new(),
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing registry instead of building one from config.
    pub fn registry(mut self, registry: Arc<BreakerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsStore>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn flags(mut self, flags: Arc<dyn FeatureFlagGate>) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Clock for breakers, metrics and latency built by this builder.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn OperationHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn build(self) -> Result<FallbackOrchestrator, ConfigError> {
        self.config.validate()?;
        let clock = self.clock.unwrap_or_else(system_clock);

        let registry = match self.registry {
            Some(registry) => registry,
            None => Arc::new(self.config.build_registry(clock.clone())?),
        };
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(self.config.build_metrics_store(clock.clone())?),
        };
        let flags: Arc<dyn FeatureFlagGate> = match self.flags {
            Some(flags) => flags,
            None => Arc::new(self.config.build_flags()?),
        };
        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingSink));

        let mut handlers: HashMap<OperationKey, Arc<dyn OperationHandler>> = HashMap::new();
        for handler in self.handlers {
            let key = handler.key().clone();
            if handlers.insert(key.clone(), handler).is_some() {
                return Err(ConfigError::InvalidValue {
                    field: "handlers".to_string(),
                    reason: format!("duplicate handler for '{}'", key),
                });
            }
        }

        Ok(FallbackOrchestrator {
            registry,
            metrics,
            flags,
            sink,
            executor: BoundedExecutor::with_clock(clock.clone()),
            handlers,
            clock,
        })
    }
}

impl Default for FallbackOrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
