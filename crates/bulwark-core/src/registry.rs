//! Keyed registry of circuit breakers.
//!
//! Breakers are created lazily on first use of a key and live as long as the
//! registry. There is no global instance; construct one and share it.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::breaker::{BreakerMetrics, CircuitBreaker};
use crate::clock::{system_clock, SharedClock};
use crate::config::{BreakerConfig, ConfigError};
use crate::types::{Admission, BreakerState, OperationKey};

/// Each key has its own circuit to allow independent recovery.
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<OperationKey, Arc<CircuitBreaker>>>,
    default_config: BreakerConfig,
    overrides: HashMap<OperationKey, BreakerConfig>,
    clock: SharedClock,
}

impl BreakerRegistry {
    /// Create a registry whose breakers use `default_config`.
    pub fn new(default_config: BreakerConfig) -> Result<Self, ConfigError> {
        Self::with_clock(default_config, system_clock())
    }

    /// Create a registry with an explicit clock.
    pub fn with_clock(default_config: BreakerConfig, clock: SharedClock) -> Result<Self, ConfigError> {
        default_config.validate()?;
        Ok(Self {
            breakers: RwLock::new(HashMap::new()),
            default_config,
            overrides: HashMap::new(),
            clock,
        })
    }

    /// Use a dedicated config for one key.
    ///
    /// Takes effect for breakers created after the call.
    pub fn with_override(mut self, key: OperationKey, config: BreakerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        self.overrides.insert(key, config);
        Ok(self)
    }

    /// Config a breaker for `key` is (or will be) built with.
    pub fn config_for(&self, key: &OperationKey) -> &BreakerConfig {
        self.overrides.get(key).unwrap_or(&self.default_config)
    }

    /// Get or create the breaker for a key.
    pub fn breaker(&self, key: &OperationKey) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(key) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write();
        breakers
            .entry(key.clone())
            .or_insert_with(|| {
                tracing::debug!(key = %key, "Creating circuit breaker");
                Arc::new(CircuitBreaker::from_validated(
                    key.clone(),
                    self.config_for(key).clone(),
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    /// Existing breaker, without creating one.
    pub fn get(&self, key: &OperationKey) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(key).cloned()
    }

    pub fn admit(&self, key: &OperationKey) -> Admission {
        self.breaker(key).admit()
    }

    pub fn record_success(&self, key: &OperationKey) {
        self.breaker(key).record_success();
    }

    pub fn record_failure(&self, key: &OperationKey, error: &str) {
        self.breaker(key).record_failure(error);
    }

    pub fn release_probe(&self, key: &OperationKey) {
        if let Some(breaker) = self.get(key) {
            breaker.release_probe();
        }
    }

    pub fn state(&self, key: &OperationKey) -> BreakerState {
        self.breaker(key).state()
    }

    pub fn metrics(&self, key: &OperationKey) -> BreakerMetrics {
        self.breaker(key).metrics()
    }

    pub fn open(&self, key: &OperationKey) {
        self.breaker(key).open();
    }

    pub fn close(&self, key: &OperationKey) {
        self.breaker(key).close();
    }

    /// Clear counts and state; the entry stays registered.
    pub fn reset(&self, key: &OperationKey) {
        self.breaker(key).reset();
    }

    /// Reset every registered breaker.
    pub fn reset_all(&self) {
        let all: Vec<Arc<CircuitBreaker>> = self.breakers.read().values().cloned().collect();
        for breaker in all {
            breaker.reset();
        }
    }

    /// Snapshots of every registered breaker, sorted by key.
    pub fn list(&self) -> Vec<BreakerMetrics> {
        let all: Vec<Arc<CircuitBreaker>> = self.breakers.read().values().cloned().collect();
        let mut metrics: Vec<BreakerMetrics> = all.iter().map(|b| b.metrics()).collect();
        metrics.sort_by(|a, b| a.key.cmp(&b.key));
        metrics
    }

    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config: BreakerConfig::default(),
            overrides: HashMap::new(),
            clock: system_clock(),
        }
    }
}
