//! Circuit breaker to prevent cascade failures.
//!
//! When an operation fails repeatedly, or keeps failing at a high rate under
//! load, the circuit opens and callers go straight to their fallback. After
//! the recovery timeout a single probe is let through; its verdict decides
//! whether the circuit closes again.
//!
//! All state lives behind one mutex per breaker. Every transition, including
//! the Open -> HalfOpen admission, happens inside a single critical section,
//! so at most one probe is ever in flight.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::clock::{system_clock, SharedClock};
use crate::config::{BreakerConfig, ConfigError};
use crate::serde_duration;
use crate::types::{Admission, AdmissionReason, BreakerState, OperationKey};

/// Failure rate at which a loaded circuit trips.
pub const TRIP_FAILURE_RATE: f64 = 0.5;

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerMetrics {
    pub key: OperationKey,
    pub state: BreakerState,

    /// Failures counted towards the threshold since the circuit last closed
    pub failure_count: u64,

    /// Successes recorded since the last reset
    pub success_count: u64,

    /// Outcomes recorded since the last reset
    pub total_requests: u64,

    /// Admissions refused since the last reset
    pub rejected_count: u64,

    pub state_changed_at: DateTime<Utc>,

    #[serde(with = "serde_duration::millis", rename = "time_in_state_ms")]
    pub time_in_state: Duration,

    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,

    /// When the next probe may be admitted, while open
    pub next_attempt_at: Option<DateTime<Utc>>,

    pub window_samples: usize,
    pub window_failure_rate: f64,
    pub probe_in_flight: bool,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u64,
    success_count: u64,
    total_requests: u64,
    rejected_count: u64,
    state_changed_at: Instant,
    state_changed_at_utc: DateTime<Utc>,
    last_failure_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    next_attempt_at: Option<Instant>,
    next_attempt_at_utc: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    /// (recorded_at, failed)
    window: VecDeque<(Instant, bool)>,
}

impl BreakerInner {
    fn new(now: Instant, now_utc: DateTime<Utc>) -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            total_requests: 0,
            rejected_count: 0,
            state_changed_at: now,
            state_changed_at_utc: now_utc,
            last_failure_at: None,
            last_error: None,
            next_attempt_at: None,
            next_attempt_at_utc: None,
            probe_in_flight: false,
            window: VecDeque::new(),
        }
    }

    fn window_stats(&self, now: Instant, span: Duration) -> (usize, usize) {
        self.window
            .iter()
            .filter(|(at, _)| now.saturating_duration_since(*at) <= span)
            .fold((0, 0), |(total, failed), (_, f)| (total + 1, failed + usize::from(*f)))
    }
}

/// One state machine guarding one operation key.
pub struct CircuitBreaker {
    key: OperationKey,
    config: BreakerConfig,
    clock: SharedClock,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker using the system clock.
    pub fn new(key: OperationKey, config: BreakerConfig) -> Result<Self, ConfigError> {
        Self::with_clock(key, config, system_clock())
    }

    /// Create a breaker with an explicit clock.
    pub fn with_clock(
        key: OperationKey,
        config: BreakerConfig,
        clock: SharedClock,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_validated(key, config, clock))
    }

    pub(crate) fn from_validated(key: OperationKey, config: BreakerConfig, clock: SharedClock) -> Self {
        let inner = BreakerInner::new(clock.now(), clock.utc_now());
        Self {
            key,
            config,
            clock,
            inner: Mutex::new(inner),
        }
    }

    pub fn key(&self) -> &OperationKey {
        &self.key
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Decide whether a call may run the primary operation.
    pub fn admit(&self) -> Admission {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let state = inner.state;
        match state {
            BreakerState::Closed => Admission::allow(AdmissionReason::Closed),
            BreakerState::Open => {
                let due = inner.next_attempt_at.is_some_and(|at| now >= at);
                if due {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.probe_in_flight = true;
                    tracing::info!(key = %self.key, "Circuit half-open, admitting recovery probe");
                    Admission::allow(AdmissionReason::Probe)
                } else {
                    inner.rejected_count += 1;
                    Admission::reject(AdmissionReason::Open)
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    inner.rejected_count += 1;
                    Admission::reject(AdmissionReason::HalfOpenBusy)
                } else {
                    inner.probe_in_flight = true;
                    tracing::debug!(key = %self.key, "Admitting recovery probe");
                    Admission::allow(AdmissionReason::Probe)
                }
            }
        }
    }

    /// Record a successful execution.
    pub fn record_success(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        inner.success_count += 1;
        inner.total_requests += 1;
        self.push_sample(&mut inner, now, false);

        if inner.state == BreakerState::HalfOpen {
            self.transition(&mut inner, BreakerState::Closed);
            tracing::info!(key = %self.key, "Circuit closed after successful recovery");
        }
    }

    /// Record a failed or timed-out execution.
    pub fn record_failure(&self, error: &str) {
        let now = self.clock.now();
        let now_utc = self.clock.utc_now();
        let mut inner = self.inner.lock();

        inner.failure_count += 1;
        inner.total_requests += 1;
        inner.last_failure_at = Some(now_utc);
        inner.last_error = Some(error.to_string());
        self.push_sample(&mut inner, now, true);

        let state = inner.state;
        match state {
            BreakerState::HalfOpen => {
                self.transition(&mut inner, BreakerState::Open);
                tracing::warn!(
                    key = %self.key,
                    error = %error,
                    "Circuit reopened after failed recovery attempt"
                );
            }
            BreakerState::Closed => {
                let (samples, failed) = inner.window_stats(now, self.config.monitoring_window);
                let threshold_hit = inner.failure_count >= u64::from(self.config.failure_threshold);
                let rate = if samples == 0 {
                    0.0
                } else {
                    failed as f64 / samples as f64
                };
                let rate_hit = samples > 0
                    && samples >= self.config.minimum_throughput as usize
                    && rate >= TRIP_FAILURE_RATE;

                if threshold_hit || rate_hit {
                    let failures = inner.failure_count;
                    self.transition(&mut inner, BreakerState::Open);
                    tracing::warn!(
                        key = %self.key,
                        failures,
                        window_samples = samples,
                        failure_rate = rate,
                        "Circuit opened after repeated failures"
                    );
                } else {
                    tracing::debug!(key = %self.key, failures = inner.failure_count, "Failure recorded");
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Clear an in-flight probe without a verdict.
    ///
    /// Used when the probe's caller went away before the operation finished.
    /// The circuit stays half-open so the next admission can probe again.
    pub fn release_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen && inner.probe_in_flight {
            inner.probe_in_flight = false;
            tracing::debug!(key = %self.key, "Recovery probe released without verdict");
        }
    }

    /// Force the circuit open.
    pub fn open(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, BreakerState::Open);
        tracing::warn!(key = %self.key, "Circuit opened manually");
    }

    /// Force the circuit closed.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, BreakerState::Closed);
        tracing::info!(key = %self.key, "Circuit closed manually");
    }

    /// Zero every counter, clear the window and close the circuit.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = BreakerInner::new(self.clock.now(), self.clock.utc_now());
        tracing::info!(key = %self.key, "Circuit reset");
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Snapshot of counters and timing.
    pub fn metrics(&self) -> BreakerMetrics {
        let now = self.clock.now();
        let inner = self.inner.lock();
        let (samples, failed) = inner.window_stats(now, self.config.monitoring_window);

        BreakerMetrics {
            key: self.key.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_requests: inner.total_requests,
            rejected_count: inner.rejected_count,
            state_changed_at: inner.state_changed_at_utc,
            time_in_state: now.saturating_duration_since(inner.state_changed_at),
            last_failure_at: inner.last_failure_at,
            last_error: inner.last_error.clone(),
            next_attempt_at: inner.next_attempt_at_utc,
            window_samples: samples,
            window_failure_rate: if samples == 0 {
                0.0
            } else {
                failed as f64 / samples as f64
            },
            probe_in_flight: inner.probe_in_flight,
        }
    }

    fn push_sample(&self, inner: &mut BreakerInner, now: Instant, failed: bool) {
        inner.window.push_back((now, failed));
        while let Some((at, _)) = inner.window.front() {
            if now.saturating_duration_since(*at) > self.config.monitoring_window {
                inner.window.pop_front();
            } else {
                break;
            }
        }
        while inner.window.len() > self.config.window_capacity {
            inner.window.pop_front();
        }
    }

    /// Apply a state change. Caller holds the lock.
    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        let now = self.clock.now();
        let now_utc = self.clock.utc_now();

        inner.state = to;
        inner.state_changed_at = now;
        inner.state_changed_at_utc = now_utc;
        inner.probe_in_flight = false;

        match to {
            BreakerState::Open => {
                // recovery_timeout is bounded by validation
                inner.next_attempt_at = now.checked_add(self.config.recovery_timeout);
                inner.next_attempt_at_utc = chrono::Duration::from_std(self.config.recovery_timeout)
                    .ok()
                    .map(|d| now_utc + d);
            }
            BreakerState::Closed => {
                inner.failure_count = 0;
                inner.next_attempt_at = None;
                inner.next_attempt_at_utc = None;
            }
            BreakerState::HalfOpen => {
                inner.next_attempt_at = None;
                inner.next_attempt_at_utc = None;
            }
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("key", &self.key)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::{Arc, Barrier};

    fn breaker(config: BreakerConfig) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::new();
        let cb = CircuitBreaker::with_clock(
            OperationKey::new("agent:workshop_3").unwrap(),
            config,
            Arc::new(clock.clone()),
        )
        .unwrap();
        (cb, clock)
    }

    fn threshold_config(threshold: u32) -> BreakerConfig {
        BreakerConfig::default()
            .with_failure_threshold(threshold)
            .with_recovery_timeout(Duration::from_secs(30))
            .with_minimum_throughput(100)
    }

    #[test]
    fn test_circuit_starts_closed() {
        let (cb, _) = breaker(BreakerConfig::default());
        assert_eq!(cb.state(), BreakerState::Closed);
        let admission = cb.admit();
        assert!(admission.allowed);
        assert_eq!(admission.reason, AdmissionReason::Closed);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = CircuitBreaker::new(
            OperationKey::new("x").unwrap(),
            BreakerConfig::default().with_failure_threshold(0),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_longest_recovery_timeout_opens_without_overflow() {
        let huge = CircuitBreaker::new(
            OperationKey::new("x").unwrap(),
            threshold_config(1).with_recovery_timeout(Duration::MAX),
        );
        assert!(huge.is_err());

        let (cb, clock) = breaker(threshold_config(1).with_recovery_timeout(crate::config::MAX_RECOVERY_TIMEOUT));
        cb.record_failure("down");
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(cb.metrics().next_attempt_at.is_some());

        clock.advance(Duration::from_secs(24 * 60 * 60));
        assert!(!cb.admit().allowed);
    }

    #[test]
    fn test_threshold_trips_breaker() {
        let (cb, clock) = breaker(threshold_config(5));

        for _ in 0..4 {
            cb.record_failure("boom");
            assert_eq!(cb.state(), BreakerState::Closed);
        }
        cb.record_failure("boom");
        assert_eq!(cb.state(), BreakerState::Open);

        let admission = cb.admit();
        assert!(!admission.allowed);
        assert_eq!(admission.reason, AdmissionReason::Open);

        clock.advance(Duration::from_secs(29));
        assert!(!cb.admit().allowed);

        clock.advance(Duration::from_secs(1));
        assert!(cb.admit().allowed);
        assert_eq!(cb.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn test_success_does_not_reset_threshold_counter() {
        let (cb, _) = breaker(threshold_config(3));

        cb.record_failure("a");
        cb.record_success();
        cb.record_failure("b");
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);

        cb.record_failure("c");
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn test_rate_trips_breaker_under_load() {
        let config = BreakerConfig::default()
            .with_failure_threshold(8)
            .with_minimum_throughput(10)
            .with_monitoring_window(Duration::from_secs(60));
        let (cb, _) = breaker(config);

        // S F S F ... ten calls, five failures, the tenth is a failure
        for i in 0..10 {
            if i % 2 == 0 {
                cb.record_success();
            } else {
                cb.record_failure("flaky");
            }
            if i < 9 {
                assert_eq!(cb.state(), BreakerState::Closed, "tripped early at call {}", i);
            }
        }

        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.metrics().failure_count, 5);
    }

    #[test]
    fn test_rate_ignores_samples_outside_window() {
        let config = BreakerConfig::default()
            .with_failure_threshold(100)
            .with_minimum_throughput(4)
            .with_monitoring_window(Duration::from_secs(10));
        let (cb, clock) = breaker(config);

        cb.record_failure("old");
        cb.record_failure("old");
        cb.record_failure("old");
        clock.advance(Duration::from_secs(11));

        cb.record_success();
        cb.record_success();
        cb.record_success();
        cb.record_failure("new");

        // Only four in-window samples, one failure
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.metrics().window_samples, 4);
    }

    #[test]
    fn test_recovery_cycle_closes_on_success() {
        let (cb, clock) = breaker(threshold_config(2));
        cb.record_failure("a");
        cb.record_failure("b");
        assert_eq!(cb.state(), BreakerState::Open);

        clock.advance(Duration::from_secs(30));
        let first = cb.admit();
        assert!(first.is_probe());
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        let second = cb.admit();
        assert!(!second.allowed);
        assert_eq!(second.reason, AdmissionReason::HalfOpenBusy);

        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.metrics().failure_count, 0);
        assert!(cb.admit().allowed);
    }

    #[test]
    fn test_failed_probe_reopens_and_restarts_timer() {
        let (cb, clock) = breaker(threshold_config(1));
        cb.record_failure("a");
        let opened = cb.metrics().next_attempt_at.unwrap();

        clock.advance(Duration::from_secs(30));
        assert!(cb.admit().is_probe());

        clock.advance(Duration::from_secs(5));
        cb.record_failure("probe failed");
        assert_eq!(cb.state(), BreakerState::Open);

        let reopened = cb.metrics().next_attempt_at.unwrap();
        assert_eq!((reopened - opened).num_seconds(), 35);

        clock.advance(Duration::from_secs(29));
        assert!(!cb.admit().allowed);
        clock.advance(Duration::from_secs(1));
        assert!(cb.admit().is_probe());
    }

    #[test]
    fn test_released_probe_can_be_retried() {
        let (cb, clock) = breaker(threshold_config(1));
        cb.record_failure("a");
        clock.advance(Duration::from_secs(30));

        assert!(cb.admit().is_probe());
        assert!(!cb.admit().allowed);

        cb.release_probe();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert!(cb.admit().is_probe());
    }

    #[test]
    fn test_failure_while_open_keeps_timer() {
        let (cb, clock) = breaker(threshold_config(1));
        cb.record_failure("a");
        let next = cb.metrics().next_attempt_at;

        clock.advance(Duration::from_secs(10));
        cb.record_failure("late");
        assert_eq!(cb.metrics().next_attempt_at, next);
    }

    #[test]
    fn test_manual_override_and_reset() {
        let (cb, _) = breaker(BreakerConfig::default());

        cb.open();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.admit().allowed);

        cb.close();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.admit().allowed);

        cb.record_failure("x");
        cb.record_success();
        cb.reset();

        let metrics = cb.metrics();
        assert_eq!(metrics.state, BreakerState::Closed);
        assert_eq!(metrics.failure_count, 0);
        assert_eq!(metrics.success_count, 0);
        assert_eq!(metrics.total_requests, 0);
        assert_eq!(metrics.window_samples, 0);
        assert!(metrics.last_error.is_none());
    }

    #[test]
    fn test_metrics_snapshot_is_idempotent() {
        let (cb, _) = breaker(threshold_config(3));
        cb.record_failure("x");
        cb.record_success();

        let first = cb.metrics();
        let second = cb.metrics();
        assert_eq!(first, second);
        assert_eq!(first.total_requests, 2);
        assert_eq!(first.last_error.as_deref(), Some("x"));
    }

    #[test]
    fn test_time_in_state_tracks_clock() {
        let (cb, clock) = breaker(BreakerConfig::default());
        clock.advance(Duration::from_secs(7));
        assert_eq!(cb.metrics().time_in_state, Duration::from_secs(7));

        cb.open();
        assert_eq!(cb.metrics().time_in_state, Duration::ZERO);
    }

    #[test]
    fn test_window_capacity_bounds_samples() {
        let config = BreakerConfig::default()
            .with_failure_threshold(1000)
            .with_window_capacity(8);
        let (cb, _) = breaker(config);

        for _ in 0..50 {
            cb.record_success();
        }
        assert_eq!(cb.metrics().window_samples, 8);
    }

    #[test]
    fn test_single_probe_under_concurrency() {
        let (cb, clock) = breaker(threshold_config(1));
        cb.record_failure("a");
        clock.advance(Duration::from_secs(30));

        let cb = Arc::new(cb);
        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let cb = cb.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    cb.admit().allowed
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|allowed| *allowed)
            .count();

        assert_eq!(admitted, 1);
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert_eq!(cb.metrics().rejected_count, (threads - 1) as u64);
    }
}
