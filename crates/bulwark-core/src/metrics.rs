//! Bounded, per-key store of execution outcomes.
//!
//! Each key owns a series guarded by its own mutex; the key map itself sits
//! behind a read-write lock that is only written when a new key shows up.
//! Appends enforce both the retention window and a hard sample cap.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::aggregate::{classify_trend, Aggregate, HealthReport, HealthStatus, Sample, Trend};
use crate::clock::{system_clock, SharedClock};
use crate::config::MetricsConfig;
use crate::types::{OperationKey, Outcome};

#[derive(Debug)]
struct Entry {
    recorded_at: Instant,
    outcome: Outcome,
}

#[derive(Debug, Default)]
struct Series {
    entries: VecDeque<Entry>,
    evicted: u64,
}

impl Series {
    fn push(&mut self, entry: Entry, retention: Duration, max_samples: usize) {
        self.entries.push_back(entry);
        let now = self.entries.back().map(|e| e.recorded_at);
        if let Some(now) = now {
            self.prune(now, retention);
        }
        while self.entries.len() > max_samples {
            self.entries.pop_front();
            self.evicted += 1;
        }
    }

    fn prune(&mut self, now: Instant, retention: Duration) {
        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(front.recorded_at) > retention {
                self.entries.pop_front();
                self.evicted += 1;
            } else {
                break;
            }
        }
    }

    fn in_window(&self, now: Instant, window: Duration) -> impl Iterator<Item = &Entry> {
        self.entries
            .iter()
            .filter(move |e| now.saturating_duration_since(e.recorded_at) <= window)
    }
}

/// Append-only store of outcomes, bounded by age and count.
pub struct MetricsStore {
    series: RwLock<HashMap<OperationKey, Arc<Mutex<Series>>>>,
    config: MetricsConfig,
    clock: SharedClock,
}

impl MetricsStore {
    /// Create a store using the system clock.
    pub fn new(config: MetricsConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    /// Create a store with an explicit clock.
    pub fn with_clock(config: MetricsConfig, clock: SharedClock) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    fn series(&self, key: &OperationKey) -> Arc<Mutex<Series>> {
        if let Some(series) = self.series.read().get(key) {
            return series.clone();
        }
        self.series
            .write()
            .entry(key.clone())
            .or_default()
            .clone()
    }

    fn existing(&self, key: &OperationKey) -> Option<Arc<Mutex<Series>>> {
        self.series.read().get(key).cloned()
    }

    /// Take ownership of an outcome.
    ///
    /// Cancelled outcomes are dropped: they say nothing about the operation.
    pub fn record(&self, outcome: Outcome) {
        if !outcome.kind.is_health_signal() {
            tracing::debug!(key = %outcome.key, "Skipping cancelled outcome");
            return;
        }

        let series = self.series(&outcome.key);
        let entry = Entry {
            recorded_at: self.clock.now(),
            outcome,
        };
        series
            .lock()
            .push(entry, self.config.retention, self.config.max_samples);
    }

    /// Copy out the outcomes recorded within `window`, oldest first.
    pub fn samples(&self, key: &OperationKey, window: Duration) -> Vec<Outcome> {
        let Some(series) = self.existing(key) else {
            return Vec::new();
        };
        let now = self.clock.now();
        let guard = series.lock();
        guard
            .in_window(now, window)
            .map(|e| e.outcome.clone())
            .collect()
    }

    fn snapshot(&self, key: &OperationKey, window: Duration) -> Vec<Sample> {
        let Some(series) = self.existing(key) else {
            return Vec::new();
        };
        let now = self.clock.now();
        let guard = series.lock();
        guard
            .in_window(now, window)
            .map(|e| Sample {
                latency_ms: e.outcome.latency.as_secs_f64() * 1000.0,
                failed: e.outcome.kind.is_failure(),
            })
            .collect()
    }

    /// Count, percentiles and failure rate over `window`.
    pub fn aggregate(&self, key: &OperationKey, window: Duration) -> Aggregate {
        let samples = self.snapshot(key, window);
        Aggregate::from_samples(&samples)
    }

    /// Latency trend over `window`.
    pub fn trend(&self, key: &OperationKey, window: Duration) -> Trend {
        let latencies: Vec<f64> = self
            .snapshot(key, window)
            .into_iter()
            .map(|s| s.latency_ms)
            .collect();
        classify_trend(&latencies)
    }

    /// Success-rate bucket over `window`.
    pub fn health(&self, key: &OperationKey, window: Duration) -> HealthReport {
        let Some(series) = self.existing(key) else {
            return HealthReport::idle();
        };
        let now = self.clock.now();
        let (count, successes, last) = {
            let guard = series.lock();
            let mut count = 0usize;
            let mut successes = 0usize;
            let mut last = None;
            for entry in guard.in_window(now, window) {
                count += 1;
                if entry.outcome.success() {
                    successes += 1;
                }
                last = Some(entry.outcome.timestamp);
            }
            (count, successes, last)
        };

        if count == 0 {
            return HealthReport::idle();
        }
        let success_rate = successes as f64 / count as f64;
        HealthReport {
            status: HealthStatus::from_success_rate(success_rate),
            success_rate,
            execution_count: count,
            last_execution: last,
        }
    }

    /// Number of samples currently held for a key.
    pub fn len(&self, key: &OperationKey) -> usize {
        self.existing(key).map(|s| s.lock().entries.len()).unwrap_or(0)
    }

    /// Samples evicted from a key by either bound.
    pub fn evicted(&self, key: &OperationKey) -> u64 {
        self.existing(key).map(|s| s.lock().evicted).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.series.read().values().all(|s| s.lock().entries.is_empty())
    }

    /// Keys with a series, sorted.
    pub fn keys(&self) -> Vec<OperationKey> {
        let mut keys: Vec<OperationKey> = self.series.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Drop all samples for a key, keeping the series.
    pub fn reset(&self, key: &OperationKey) {
        if let Some(series) = self.existing(key) {
            let mut guard = series.lock();
            guard.entries.clear();
            guard.evicted = 0;
        }
    }

    /// Evict aged samples from every series.
    pub fn prune(&self) {
        let now = self.clock.now();
        let all: Vec<Arc<Mutex<Series>>> = self.series.read().values().cloned().collect();
        for series in all {
            series.lock().prune(now, self.config.retention);
        }
    }
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn key(name: &str) -> OperationKey {
        OperationKey::new(name).unwrap()
    }

    fn store_with(config: MetricsConfig) -> (MetricsStore, ManualClock) {
        let clock = ManualClock::new();
        let store = MetricsStore::with_clock(config, Arc::new(clock.clone()));
        (store, clock)
    }

    #[test]
    fn test_aggregate_over_window() {
        let (store, clock) = store_with(MetricsConfig::default());
        let k = key("agent:workshop_1");

        store.record(Outcome::succeeded(k.clone(), Duration::from_millis(10)));
        clock.advance(Duration::from_secs(120));
        store.record(Outcome::succeeded(k.clone(), Duration::from_millis(20)));
        store.record(Outcome::failed(k.clone(), Duration::from_millis(30), "boom"));

        let recent = store.aggregate(&k, Duration::from_secs(60));
        assert_eq!(recent.count, 2);
        assert_eq!(recent.failure_count, 1);
        assert_eq!(recent.failure_rate, 0.5);
        assert_eq!(recent.min, 20.0);

        let all = store.aggregate(&k, Duration::from_secs(600));
        assert_eq!(all.count, 3);
    }

    #[test]
    fn test_count_bound_enforced_within_window() {
        let config = MetricsConfig {
            max_samples: 5,
            ..Default::default()
        };
        let (store, _clock) = store_with(config);
        let k = key("burst");

        for i in 0..20 {
            store.record(Outcome::succeeded(k.clone(), Duration::from_millis(i)));
        }

        assert_eq!(store.len(&k), 5);
        assert_eq!(store.evicted(&k), 15);
        // Oldest evicted first
        let agg = store.aggregate(&k, Duration::from_secs(60));
        assert_eq!(agg.min, 15.0);
        assert_eq!(agg.max, 19.0);
    }

    #[test]
    fn test_retention_bound_enforced_on_append() {
        let config = MetricsConfig {
            retention: Duration::from_secs(10),
            default_window: Duration::from_secs(10),
            ..Default::default()
        };
        let (store, clock) = store_with(config);
        let k = key("aged");

        store.record(Outcome::succeeded(k.clone(), Duration::from_millis(1)));
        store.record(Outcome::succeeded(k.clone(), Duration::from_millis(1)));
        clock.advance(Duration::from_secs(11));
        store.record(Outcome::succeeded(k.clone(), Duration::from_millis(1)));

        assert_eq!(store.len(&k), 1);
    }

    #[test]
    fn test_prune_evicts_idle_series() {
        let config = MetricsConfig {
            retention: Duration::from_secs(5),
            default_window: Duration::from_secs(5),
            ..Default::default()
        };
        let (store, clock) = store_with(config);
        let k = key("idle");

        store.record(Outcome::succeeded(k.clone(), Duration::from_millis(1)));
        clock.advance(Duration::from_secs(6));
        store.prune();

        assert_eq!(store.len(&k), 0);
        assert!(store.is_empty());
        assert_eq!(store.keys(), vec![k]);
    }

    #[test]
    fn test_cancelled_outcomes_not_stored() {
        let (store, _clock) = store_with(MetricsConfig::default());
        let k = key("cancel");

        store.record(Outcome::cancelled(k.clone(), Duration::from_millis(3)));
        assert_eq!(store.len(&k), 0);
        assert_eq!(store.aggregate(&k, Duration::from_secs(60)).count, 0);
    }

    #[test]
    fn test_timeouts_count_as_failures() {
        let (store, _clock) = store_with(MetricsConfig::default());
        let k = key("slow");

        store.record(Outcome::timed_out(k.clone(), Duration::from_millis(50)));
        store.record(Outcome::succeeded(k.clone(), Duration::from_millis(5)));

        let agg = store.aggregate(&k, Duration::from_secs(60));
        assert_eq!(agg.failure_count, 1);
        assert_eq!(agg.max, 50.0);
    }

    #[test]
    fn test_trend_from_latencies() {
        let (store, _clock) = store_with(MetricsConfig::default());
        let k = key("trend");

        for latency in [10, 10, 10, 30, 30, 30] {
            store.record(Outcome::succeeded(k.clone(), Duration::from_millis(latency)));
        }
        assert_eq!(store.trend(&k, Duration::from_secs(60)), Trend::Increasing);
        assert_eq!(store.trend(&key("unknown"), Duration::from_secs(60)), Trend::Stable);
    }

    #[test]
    fn test_health_report() {
        let (store, _clock) = store_with(MetricsConfig::default());
        let k = key("health");

        assert_eq!(store.health(&k, Duration::from_secs(60)).status, HealthStatus::Idle);

        for _ in 0..9 {
            store.record(Outcome::succeeded(k.clone(), Duration::from_millis(1)));
        }
        store.record(Outcome::failed(k.clone(), Duration::from_millis(1), "x"));

        let report = store.health(&k, Duration::from_secs(60));
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.execution_count, 10);
        assert!((report.success_rate - 0.9).abs() < 1e-9);
        assert!(report.last_execution.is_some());
    }

    #[test]
    fn test_reset_keeps_series() {
        let (store, _clock) = store_with(MetricsConfig::default());
        let k = key("reset");

        store.record(Outcome::succeeded(k.clone(), Duration::from_millis(1)));
        store.reset(&k);

        assert_eq!(store.len(&k), 0);
        assert_eq!(store.keys(), vec![k]);
    }

    #[test]
    fn test_concurrent_appends_respect_cap() {
        let config = MetricsConfig {
            max_samples: 100,
            ..Default::default()
        };
        let store = Arc::new(MetricsStore::new(config));
        let k = key("concurrent");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let k = k.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        store.record(Outcome::succeeded(k.clone(), Duration::from_millis(1)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(&k), 100);
        assert_eq!(store.evicted(&k), 300);
    }
}
