//! Rolling aggregates over a window of outcomes.
//!
//! Everything here is a pure function of a snapshot. The store copies the
//! in-window samples out under its lock and calls into this module after
//! releasing it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Trend threshold, as a fraction of the first-half mean.
pub const TREND_THRESHOLD: f64 = 0.05;

/// Success rate at or above which an operation is healthy.
pub const HEALTHY_SUCCESS_RATE: f64 = 0.95;

/// Success rate at or above which an operation is degraded rather than unhealthy.
pub const DEGRADED_SUCCESS_RATE: f64 = 0.80;

/// One in-window data point, copied out of the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Latency in milliseconds
    pub latency_ms: f64,

    /// Whether the execution counted as a failure
    pub failed: bool,
}

/// Derived statistics for a window. Latencies are milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub failure_rate: f64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl Aggregate {
    /// Compute an aggregate from a snapshot of samples.
    pub fn from_samples(samples: &[Sample]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let count = samples.len();
        let failure_count = samples.iter().filter(|s| s.failed).count();

        let mut latencies: Vec<f64> = samples.iter().map(|s| s.latency_ms).collect();
        latencies.sort_by(|a, b| a.total_cmp(b));

        let sum: f64 = latencies.iter().sum();
        let mean = sum / count as f64;
        let variance = latencies
            .iter()
            .map(|v| (v - mean).powi(2))
            .sum::<f64>()
            / count as f64;

        Self {
            count,
            success_count: count - failure_count,
            failure_count,
            failure_rate: failure_count as f64 / count as f64,
            sum,
            min: latencies[0],
            max: latencies[count - 1],
            mean,
            stddev: variance.sqrt(),
            p50: percentile(&latencies, 0.50),
            p95: percentile(&latencies, 0.95),
            p99: percentile(&latencies, 0.99),
        }
    }
}

/// Nearest-rank percentile over ascending values.
///
/// Index is `ceil(n * p) - 1`, clamped into range. Empty input yields 0.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (sorted.len() as f64 * p).ceil() as i64 - 1;
    let index = rank.clamp(0, sorted.len() as i64 - 1) as usize;
    sorted[index]
}

/// Direction of a metric across a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Increasing => "increasing",
            Self::Decreasing => "decreasing",
            Self::Stable => "stable",
        })
    }
}

/// Classify chronologically ordered values.
///
/// Compares the mean of the first half with the mean of the second half;
/// the split point is `floor(n / 2)`.
pub fn classify_trend(values: &[f64]) -> Trend {
    if values.len() < 2 {
        return Trend::Stable;
    }

    let mid = values.len() / 2;
    let (first, second) = values.split_at(mid);
    let first_mean = first.iter().sum::<f64>() / first.len() as f64;
    let second_mean = second.iter().sum::<f64>() / second.len() as f64;

    let threshold = first_mean * TREND_THRESHOLD;
    if second_mean > first_mean + threshold {
        Trend::Increasing
    } else if second_mean < first_mean - threshold {
        Trend::Decreasing
    } else {
        Trend::Stable
    }
}

/// Coarse health bucket derived from success rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    /// No executions in the window
    Idle,
}

impl HealthStatus {
    pub fn from_success_rate(rate: f64) -> Self {
        if rate >= HEALTHY_SUCCESS_RATE {
            Self::Healthy
        } else if rate >= DEGRADED_SUCCESS_RATE {
            Self::Degraded
        } else {
            Self::Unhealthy
        }
    }
}

/// Health summary for one operation key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub success_rate: f64,
    pub execution_count: usize,
    pub last_execution: Option<DateTime<Utc>>,
}

impl HealthReport {
    pub fn idle() -> Self {
        Self {
            status: HealthStatus::Idle,
            success_rate: 0.0,
            execution_count: 0,
            last_execution: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ok(latency_ms: f64) -> Sample {
        Sample {
            latency_ms,
            failed: false,
        }
    }

    fn err(latency_ms: f64) -> Sample {
        Sample {
            latency_ms,
            failed: true,
        }
    }

    #[test]
    fn test_empty_window_is_zero() {
        let agg = Aggregate::from_samples(&[]);
        assert_eq!(agg, Aggregate::default());
        assert_eq!(agg.failure_rate, 0.0);
    }

    #[test]
    fn test_basic_statistics() {
        let samples = [ok(10.0), ok(20.0), err(30.0), ok(40.0)];
        let agg = Aggregate::from_samples(&samples);

        assert_eq!(agg.count, 4);
        assert_eq!(agg.success_count, 3);
        assert_eq!(agg.failure_count, 1);
        assert_eq!(agg.failure_rate, 0.25);
        assert_eq!(agg.sum, 100.0);
        assert_eq!(agg.min, 10.0);
        assert_eq!(agg.max, 40.0);
        assert_eq!(agg.mean, 25.0);
        // population stddev of 10,20,30,40
        assert!((agg.stddev - 125.0_f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_nearest_rank_percentiles() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile(&values, 0.50), 50.0);
        assert_eq!(percentile(&values, 0.95), 95.0);
        assert_eq!(percentile(&values, 0.99), 99.0);

        let small = [5.0, 7.0, 9.0];
        assert_eq!(percentile(&small, 0.50), 7.0);
        assert_eq!(percentile(&small, 0.99), 9.0);
        assert_eq!(percentile(&small, 0.0), 5.0);
    }

    #[test]
    fn test_trend_uses_five_percent_threshold() {
        assert_eq!(classify_trend(&[100.0, 100.0, 104.0, 104.0]), Trend::Stable);
        assert_eq!(classify_trend(&[100.0, 100.0, 106.0, 106.0]), Trend::Increasing);
        assert_eq!(classify_trend(&[100.0, 100.0, 94.0, 94.0]), Trend::Decreasing);
        assert_eq!(classify_trend(&[42.0]), Trend::Stable);
    }

    #[test]
    fn test_trend_odd_length_split() {
        // first half = [10], second half = [10, 40]
        assert_eq!(classify_trend(&[10.0, 10.0, 40.0]), Trend::Increasing);
    }

    #[test]
    fn test_health_buckets() {
        assert_eq!(HealthStatus::from_success_rate(1.0), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_success_rate(0.95), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_success_rate(0.9), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_success_rate(0.5), HealthStatus::Unhealthy);
    }

    proptest! {
        #[test]
        fn prop_percentiles_are_ordered(
            raw in prop::collection::vec((0.0f64..10_000.0, any::<bool>()), 1..200)
        ) {
            let samples: Vec<Sample> = raw
                .iter()
                .map(|(latency_ms, failed)| Sample { latency_ms: *latency_ms, failed: *failed })
                .collect();
            let agg = Aggregate::from_samples(&samples);

            prop_assert!(agg.min <= agg.p50);
            prop_assert!(agg.p50 <= agg.p95);
            prop_assert!(agg.p95 <= agg.p99);
            prop_assert!(agg.p99 <= agg.max);
            prop_assert!(agg.min <= agg.mean + 1e-9 && agg.mean <= agg.max + 1e-9);
        }

        #[test]
        fn prop_failure_rate_bounded(
            flags in prop::collection::vec(any::<bool>(), 1..200)
        ) {
            let samples: Vec<Sample> = flags
                .iter()
                .map(|failed| Sample { latency_ms: 1.0, failed: *failed })
                .collect();
            let agg = Aggregate::from_samples(&samples);

            prop_assert!((0.0..=1.0).contains(&agg.failure_rate));
            prop_assert_eq!(agg.success_count + agg.failure_count, agg.count);
        }
    }
}
