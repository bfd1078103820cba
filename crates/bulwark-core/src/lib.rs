//! # bulwark-core
//!
//! Per-key circuit breakers and rolling outcome metrics.
//!
//! This crate is synchronous and has no runtime dependency. It answers:
//! - May this operation run right now?
//! - How has it been doing over the last few minutes?
//!
//! ## Key Guarantees
//!
//! 1. **One probe**: a half-open breaker admits exactly one trial at a time
//! 2. **Bounded**: metrics series are capped by age and by sample count
//! 3. **Snapshots**: every read returns an owned value, never a live view
//! 4. **Injectable time**: all timing goes through a [`Clock`]
//!
//! ## Example
//!
//! ```rust
//! use bulwark_core::{BreakerConfig, BreakerRegistry, BreakerState, OperationKey};
//!
//! let registry = BreakerRegistry::new(BreakerConfig::default().with_failure_threshold(2))?;
//! let key = OperationKey::new("agent:workshop_3")?;
//!
//! registry.record_failure(&key, "upstream refused");
//! registry.record_failure(&key, "upstream refused");
//!
//! assert_eq!(registry.state(&key), BreakerState::Open);
//! assert!(!registry.admit(&key).allowed);
//! # Ok::<(), bulwark_core::ConfigError>(())
//! ```

pub mod aggregate;
pub mod breaker;
pub mod clock;
pub mod config;
pub mod metrics;
pub mod registry;
pub mod serde_duration;
pub mod types;

pub use aggregate::{Aggregate, HealthReport, HealthStatus, Trend};
pub use breaker::{BreakerMetrics, CircuitBreaker};
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use config::{BreakerConfig, ConfigError, MetricsConfig, MAX_RECOVERY_TIMEOUT};
pub use metrics::MetricsStore;
pub use registry::BreakerRegistry;
pub use types::{Admission, AdmissionReason, BreakerState, OperationKey, Outcome, OutcomeKind};
