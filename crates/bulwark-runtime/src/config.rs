//! Runtime configuration.
//!
//! One document configures breaker defaults, per-key overrides, metrics
//! retention, the event channel and the flag rules.
//!
//! ```yaml
//! breaker:
//!   failure_threshold: 3
//!   recovery_timeout: 100ms
//!   operation_timeout: 50ms
//! overrides:
//!   "agent:workshop_3":
//!     failure_threshold: 1
//! metrics:
//!   retention: 1h
//! sink:
//!   channel_capacity: 1024
//! flags:
//!   default_enabled: true
//!   rules:
//!     - name: agent:legacy
//!       enabled: false
//! ```

use bulwark_core::{
    BreakerConfig, BreakerRegistry, ConfigError, MetricsConfig, MetricsStore, OperationKey, SharedClock,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::flags::{FlagRule, StaticFlags};

/// Event channel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Events buffered before [`ChannelSink`](crate::ChannelSink) starts dropping
    pub channel_capacity: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self { channel_capacity: 1024 }
    }
}

/// Flag rules for a [`StaticFlags`] gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlagsConfig {
    pub default_enabled: bool,

    pub rules: Vec<FlagRule>,
}

impl Default for FlagsConfig {
    fn default() -> Self {
        Self {
            default_enabled: true,
            rules: Vec::new(),
        }
    }
}

/// Everything the runtime needs to build its components.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Defaults for every breaker
    pub breaker: BreakerConfig,

    /// Per-key breaker configs, replacing the defaults entirely
    pub overrides: HashMap<String, BreakerConfig>,

    pub metrics: MetricsConfig,

    pub sink: SinkConfig,

    pub flags: FlagsConfig,
}

impl RuntimeConfig {
    /// Parse from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Pick the parser by extension; anything but `.json` is read as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_file(path),
            _ => Self::from_yaml_file(path),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.breaker.validate()?;
        for (key, config) in &self.overrides {
            OperationKey::new(key.as_str())?;
            config.validate().map_err(|e| match e {
                ConfigError::InvalidValue { field, reason } => ConfigError::InvalidValue {
                    field: format!("overrides.{}.{}", key, field),
                    reason,
                },
                other => other,
            })?;
        }
        self.metrics.validate()?;
        if self.sink.channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sink.channel_capacity".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        self.build_flags()?;
        Ok(())
    }

    /// Breaker config for `key`, honouring overrides.
    pub fn breaker_for(&self, key: &OperationKey) -> &BreakerConfig {
        self.overrides.get(key.as_str()).unwrap_or(&self.breaker)
    }

    pub fn build_registry(&self, clock: SharedClock) -> Result<BreakerRegistry, ConfigError> {
        let mut registry = BreakerRegistry::with_clock(self.breaker.clone(), clock)?;
        for (key, config) in &self.overrides {
            registry = registry.with_override(OperationKey::new(key.as_str())?, config.clone())?;
        }
        Ok(registry)
    }

    pub fn build_metrics_store(&self, clock: SharedClock) -> Result<MetricsStore, ConfigError> {
        self.metrics.validate()?;
        Ok(MetricsStore::with_clock(self.metrics.clone(), clock))
    }

    pub fn build_flags(&self) -> Result<StaticFlags, ConfigError> {
        StaticFlags::from_rules(self.flags.default_enabled, self.flags.rules.clone())
    }
}
