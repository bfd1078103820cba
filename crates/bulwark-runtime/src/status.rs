//! Read-only query surface over breakers and metrics.

use bulwark_core::{
    Aggregate, BreakerMetrics, BreakerRegistry, HealthReport, MetricsStore, OperationKey, Trend,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Status of one operation key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationStatus {
    pub key: OperationKey,

    /// `None` if no breaker has been created for the key yet
    pub breaker: Option<BreakerMetrics>,

    pub aggregate: Aggregate,

    pub trend: Trend,

    pub health: HealthReport,
}

/// Every known key at one instant, ready to serialize for a dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub generated_at: DateTime<Utc>,

    #[serde(with = "bulwark_core::serde_duration::millis", rename = "window_ms")]
    pub window: Duration,

    pub operations: Vec<OperationStatus>,
}

/// Query handle sharing the orchestrator's registry and store.
#[derive(Clone)]
pub struct StatusBoard {
    registry: Arc<BreakerRegistry>,
    metrics: Arc<MetricsStore>,
}

impl StatusBoard {
    pub fn new(registry: Arc<BreakerRegistry>, metrics: Arc<MetricsStore>) -> Self {
        Self { registry, metrics }
    }

    pub fn list_breakers(&self) -> Vec<BreakerMetrics> {
        self.registry.list()
    }

    pub fn get_aggregate(&self, key: &OperationKey, window: Duration) -> Aggregate {
        self.metrics.aggregate(key, window)
    }

    pub fn trend(&self, key: &OperationKey, window: Duration) -> Trend {
        self.metrics.trend(key, window)
    }

    pub fn health(&self, key: &OperationKey, window: Duration) -> HealthReport {
        self.metrics.health(key, window)
    }

    /// Status for the union of breaker keys and metrics keys, sorted by key.
    pub fn snapshot(&self, window: Duration) -> StatusSnapshot {
        let mut keys: BTreeSet<OperationKey> = self.metrics.keys().into_iter().collect();
        let breakers = self.registry.list();
        keys.extend(breakers.iter().map(|b| b.key.clone()));

        let operations = keys
            .into_iter()
            .map(|key| OperationStatus {
                breaker: breakers.iter().find(|b| b.key == key).cloned(),
                aggregate: self.metrics.aggregate(&key, window),
                trend: self.metrics.trend(&key, window),
                health: self.metrics.health(&key, window),
                key,
            })
            .collect();

        StatusSnapshot {
            generated_at: Utc::now(),
            window,
            operations,
        }
    }
}
