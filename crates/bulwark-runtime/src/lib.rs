//! # bulwark-runtime
//!
//! Timeout-bounded execution and fallback orchestration on tokio.
//!
//! Builds on `bulwark-core`: every orchestrated call goes through a feature
//! flag gate, the key's circuit breaker and a [`BoundedExecutor`], and ends up
//! as one outcome in the [`MetricsStore`](bulwark_core::MetricsStore) plus one
//! [`ResilienceEvent`] in the configured sink.
//!
//! ## Example
//!
//! ```rust,no_run
//! use bulwark_runtime::{FallbackOrchestrator, Operation, OperationKey, RuntimeConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = RuntimeConfig::from_yaml_file("bulwark.yaml")?;
//! let orchestrator = FallbackOrchestrator::builder().config(config).build()?;
//! let key = OperationKey::new("agent:workshop_3")?;
//!
//! let answer = orchestrator
//!     .invoke(
//!         &key,
//!         Operation::new(|| async { Ok("fresh analysis".to_string()) }),
//!         Some(Operation::new(|| async { Ok("cached analysis".to_string()) })),
//!     )
//!     .await?;
//!
//! println!("{} (fallback: {})", answer.value, answer.fallback_used);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod executor;
pub mod flags;
pub mod handler;
pub mod invocation;
pub mod maintenance;
pub mod orchestrator;
pub mod sink;
pub mod status;

pub use config::{FlagsConfig, RuntimeConfig, SinkConfig};
pub use error::{ExecError, InvokeError};
pub use executor::BoundedExecutor;
pub use flags::{
    AlwaysEnabled, ConditionOperator, FeatureFlagGate, FlagCondition, FlagContext, FlagEvaluation, FlagRule,
    StaticFlags,
};
pub use handler::OperationHandler;
pub use invocation::{ExecutionPath, FallbackReason, Invocation, InvokeOptions, Operation};
pub use maintenance::MetricsPruner;
pub use orchestrator::{FallbackOrchestrator, FallbackOrchestratorBuilder};
pub use sink::{
    ChannelSink, EventAggregator, EventSink, EventTally, FanoutSink, NoopSink, ResilienceEvent, TallyHandle,
    TracingSink,
};
pub use status::{OperationStatus, StatusBoard, StatusSnapshot};

pub use bulwark_core::{
    BreakerConfig, BreakerMetrics, BreakerRegistry, BreakerState, ConfigError, MetricsConfig, MetricsStore,
    OperationKey, Outcome, OutcomeKind,
};
pub use tokio_util::sync::CancellationToken;
