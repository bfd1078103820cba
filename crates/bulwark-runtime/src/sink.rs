//! Structured resilience events.
//!
//! The orchestrator emits one [`ResilienceEvent`] per call. Sinks must not
//! block: [`ChannelSink`] drops events when its buffer is full and counts them.

use bulwark_core::{BreakerState, OperationKey, OutcomeKind};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::invocation::ExecutionPath;

/// What happened on one orchestrated call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceEvent {
    pub operation: OperationKey,

    /// Outcome of the primary; `None` when the primary was never attempted
    pub outcome: Option<OutcomeKind>,

    #[serde(with = "bulwark_core::serde_duration::millis", rename = "latency_ms")]
    pub latency: Duration,

    pub breaker_state: BreakerState,

    pub fallback_used: bool,

    pub path: ExecutionPath,

    /// Whether the caller got a value back
    pub succeeded: bool,

    pub timestamp: DateTime<Utc>,
}

/// Receives events. Implementations must return quickly.
pub trait EventSink: Send + Sync {
    fn record(&self, event: ResilienceEvent);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn record(&self, _event: ResilienceEvent) {}
}

/// Emits each event as a `tracing` event on target `bulwark::events`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: ResilienceEvent) {
        tracing::info!(
            target: "bulwark::events",
            operation = %event.operation,
            outcome = ?event.outcome,
            latency_ms = event.latency.as_millis() as u64,
            breaker_state = %event.breaker_state,
            fallback_used = event.fallback_used,
            path = %event.path,
            succeeded = event.succeeded,
            "Resilience event"
        );
    }
}

/// Forwards every event to each inner sink in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutSink {
    fn record(&self, event: ResilienceEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record(event.clone());
            }
            last.record(event);
        }
    }
}

/// Bounded channel sender. Full or closed channels drop the event.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ResilienceEvent>,
    dropped: Arc<AtomicU64>,
}

impl ChannelSink {
    /// Events dropped so far because the buffer was full or the receiver gone.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for ChannelSink {
    fn record(&self, event: ResilienceEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            match e {
                mpsc::error::TrySendError::Full(event) => {
                    tracing::debug!(operation = %event.operation, dropped = total, "Event buffer full, dropping event");
                }
                mpsc::error::TrySendError::Closed(event) => {
                    tracing::debug!(operation = %event.operation, dropped = total, "Event receiver closed, dropping event");
                }
            }
        }
    }
}

/// Per-key event counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTally {
    pub total: u64,

    /// Calls that returned a value
    pub succeeded: u64,

    pub primary_successes: u64,

    pub primary_failures: u64,

    pub primary_timeouts: u64,

    pub cancellations: u64,

    pub fallbacks: u64,

    pub short_circuited: u64,

    pub flag_disabled: u64,
}

impl EventTally {
    fn apply(&mut self, event: &ResilienceEvent) {
        self.total += 1;
        if event.succeeded {
            self.succeeded += 1;
        }
        if event.fallback_used {
            self.fallbacks += 1;
        }
        match event.outcome {
            Some(OutcomeKind::Success) => self.primary_successes += 1,
            Some(OutcomeKind::Failure) => self.primary_failures += 1,
            Some(OutcomeKind::Timeout) => self.primary_timeouts += 1,
            Some(OutcomeKind::Cancelled) => self.cancellations += 1,
            None => {}
        }
        match event.path {
            ExecutionPath::FallbackCircuitOpen => self.short_circuited += 1,
            ExecutionPath::FallbackFlagDisabled => self.flag_disabled += 1,
            _ => {}
        }
    }

    /// Share of calls answered by a fallback.
    pub fn fallback_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.fallbacks as f64 / self.total as f64
        }
    }
}

/// Read handle onto an aggregator's tallies.
#[derive(Clone, Default)]
pub struct TallyHandle {
    tallies: Arc<Mutex<BTreeMap<OperationKey, EventTally>>>,
}

impl TallyHandle {
    pub fn snapshot(&self) -> BTreeMap<OperationKey, EventTally> {
        self.tallies.lock().clone()
    }

    pub fn get(&self, key: &OperationKey) -> Option<EventTally> {
        self.tallies.lock().get(key).cloned()
    }
}

/// Consumes events from a [`ChannelSink`] and tallies them per key.
///
/// Runs until every sender has been dropped.
pub struct EventAggregator {
    rx: mpsc::Receiver<ResilienceEvent>,
    handle: TallyHandle,
}

impl EventAggregator {
    /// Create a bounded channel pair.
    pub fn channel(capacity: usize) -> (ChannelSink, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = ChannelSink {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        let aggregator = Self {
            rx,
            handle: TallyHandle::default(),
        };
        (sink, aggregator)
    }

    pub fn handle(&self) -> TallyHandle {
        self.handle.clone()
    }

    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            self.handle.tallies.lock().entry(event.operation.clone()).or_default().apply(&event);
        }
        tracing::debug!("Event aggregator stopped");
    }

    /// Run on the current tokio runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
