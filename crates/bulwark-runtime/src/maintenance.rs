//! Background upkeep for the metrics store.
//!
//! Recording evicts aged samples only for the key being written, so a key
//! that goes quiet keeps its last hour of outcomes until something sweeps it.
//! [`MetricsPruner`] is that sweep.

use bulwark_core::MetricsStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Floor for the sweep period; `tokio::time::interval` rejects zero.
const MIN_PRUNE_INTERVAL: Duration = Duration::from_millis(1);

/// Periodically evicts aged samples from every series in a store.
pub struct MetricsPruner {
    store: Arc<MetricsStore>,
    interval: Duration,
}

impl MetricsPruner {
    /// Sweep at the store's configured `prune_interval`.
    pub fn new(store: Arc<MetricsStore>) -> Self {
        let interval = store.config().prune_interval;
        Self { store, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sweep until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let period = self.interval.max(MIN_PRUNE_INTERVAL);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::debug!(interval_ms = period.as_millis() as u64, "Starting metrics pruner");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.store.prune();
                    tracing::trace!(keys = self.store.keys().len(), "Pruned aged samples");
                }
            }
        }
        tracing::debug!("Metrics pruner stopped");
    }

    /// Run the sweep on its own task.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
