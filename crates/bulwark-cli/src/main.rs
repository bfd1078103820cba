//! # bulwark
//!
//! Validate a runtime config, or drive synthetic load through a breaker and
//! print the resulting status board as JSON.

use anyhow::{Context, Result};
use bulwark_core::OperationKey;
use bulwark_runtime::{
    CancellationToken, EventAggregator, EventSink, FallbackOrchestrator, FanoutSink, InvokeError, MetricsPruner,
    Operation, RuntimeConfig, TracingSink,
};
use clap::{Parser, Subcommand, ValueEnum};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bulwark")]
#[command(about = "Circuit breaker and fallback toolkit")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a config file, then print the effective config
    Validate {
        /// YAML or JSON config file
        path: PathBuf,

        #[arg(long, value_enum, default_value = "yaml")]
        format: Format,
    },

    /// Run synthetic requests through one key and print the status board
    Simulate {
        /// Operation key to exercise
        #[arg(short, long, default_value = "sim:primary")]
        key: String,

        /// Config file; defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[arg(short = 'n', long, default_value_t = 200)]
        requests: u64,

        /// Share of primaries that fail, 0.0..=1.0
        #[arg(long, default_value_t = 0.2)]
        failure_rate: f64,

        /// Share of primaries that hang past the operation timeout, 0.0..=1.0
        #[arg(long, default_value_t = 0.0)]
        timeout_rate: f64,

        /// Latency of a normal primary, e.g. "5ms"
        #[arg(long, default_value = "5ms", value_parser = humantime::parse_duration)]
        latency: Duration,

        #[arg(long, default_value_t = 8)]
        concurrency: usize,

        /// Skip the fallback so failures surface as errors
        #[arg(long)]
        no_fallback: bool,

        /// Aggregation window for the report
        #[arg(long, default_value = "10m", value_parser = humantime::parse_duration)]
        window: Duration,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Yaml,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Validate { path, format } => validate(&path, format),
        Commands::Simulate {
            key,
            config,
            requests,
            failure_rate,
            timeout_rate,
            latency,
            concurrency,
            no_fallback,
            window,
        } => {
            let plan = LoadPlan {
                requests,
                failure_rate: failure_rate.clamp(0.0, 1.0),
                timeout_rate: timeout_rate.clamp(0.0, 1.0),
                latency,
                concurrency: concurrency.max(1),
                fallback: !no_fallback,
            };
            simulate(&key, config.as_deref(), plan, window).await
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<RuntimeConfig> {
    match path {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("Failed to load config: {}", path.display())),
        None => Ok(RuntimeConfig::default()),
    }
}

fn validate(path: &std::path::Path, format: Format) -> Result<()> {
    let config = load_config(Some(path))?;
    tracing::info!(path = %path.display(), overrides = config.overrides.len(), "Config is valid");

    let rendered = match format {
        Format::Yaml => serde_yaml::to_string(&config).context("Failed to render config as YAML")?,
        Format::Json => serde_json::to_string_pretty(&config).context("Failed to render config as JSON")?,
    };
    println!("{}", rendered);
    Ok(())
}

struct LoadPlan {
    requests: u64,
    failure_rate: f64,
    timeout_rate: f64,
    latency: Duration,
    concurrency: usize,
    fallback: bool,
}

impl LoadPlan {
    /// Request `i` lands in bucket `(i * 37) % 100`; 37 is coprime with 100 so
    /// every run of 100 requests covers each bucket once.
    fn behaviour(&self, i: u64) -> Behaviour {
        let bucket = ((i * 37) % 100) as f64 / 100.0;
        if bucket < self.timeout_rate {
            Behaviour::Hang
        } else if bucket < self.timeout_rate + self.failure_rate {
            Behaviour::Fail
        } else {
            Behaviour::Succeed
        }
    }
}

#[derive(Clone, Copy)]
enum Behaviour {
    Succeed,
    Fail,
    Hang,
}

#[derive(Default, Serialize)]
struct RunSummary {
    requests: u64,
    primary: u64,
    fallback: u64,
    errors: u64,
    short_circuited: u64,
    dropped_events: u64,
}

#[derive(Serialize)]
struct Report {
    summary: RunSummary,
    status: bulwark_runtime::StatusSnapshot,
    events: std::collections::BTreeMap<OperationKey, bulwark_runtime::EventTally>,
}

async fn simulate(key: &str, config: Option<&std::path::Path>, plan: LoadPlan, window: Duration) -> Result<()> {
    let key = OperationKey::new(key).context("Invalid operation key")?;
    let config = load_config(config)?;
    let hang = config.breaker_for(&key).operation_timeout * 2;

    let (channel, aggregator) = EventAggregator::channel(config.sink.channel_capacity);
    let tallies = aggregator.handle();
    let task = aggregator.spawn();
    let sink: Arc<dyn EventSink> = Arc::new(
        FanoutSink::new()
            .with(Arc::new(TracingSink))
            .with(Arc::new(channel.clone())),
    );

    let orchestrator = FallbackOrchestrator::builder()
        .config(config)
        .sink(sink)
        .build()
        .context("Failed to build orchestrator")?;
    let shutdown = CancellationToken::new();
    let pruner = MetricsPruner::new(orchestrator.metrics().clone()).spawn(shutdown.clone());

    tracing::info!(key = %key, requests = plan.requests, concurrency = plan.concurrency, "Starting simulation");

    let results: Vec<Result<bool, InvokeError>> = stream::iter(0..plan.requests)
        .map(|i| {
            let behaviour = plan.behaviour(i);
            let latency = plan.latency;
            let primary = Operation::new(move || async move {
                match behaviour {
                    Behaviour::Succeed => {
                        tokio::time::sleep(latency).await;
                        Ok(i)
                    }
                    Behaviour::Fail => {
                        tokio::time::sleep(latency).await;
                        anyhow::bail!("synthetic failure on request {}", i)
                    }
                    Behaviour::Hang => {
                        tokio::time::sleep(hang).await;
                        Ok(i)
                    }
                }
            });
            let fallback = plan.fallback.then(|| Operation::new(move || async move { Ok(i) }));
            let orchestrator = &orchestrator;
            let key = &key;
            async move {
                orchestrator
                    .invoke(key, primary, fallback)
                    .await
                    .map(|invocation| invocation.fallback_used)
            }
        })
        .buffer_unordered(plan.concurrency)
        .collect()
        .await;

    let mut summary = RunSummary {
        requests: plan.requests,
        ..RunSummary::default()
    };
    for result in &results {
        match result {
            Ok(false) => summary.primary += 1,
            Ok(true) => summary.fallback += 1,
            Err(InvokeError::CircuitOpen { .. }) => {
                summary.errors += 1;
                summary.short_circuited += 1;
            }
            Err(_) => summary.errors += 1,
        }
    }

    let status = orchestrator.status_board().snapshot(window);
    shutdown.cancel();
    pruner.await.context("Metrics pruner task failed")?;
    summary.dropped_events = channel.dropped();
    drop(channel);
    drop(orchestrator);
    task.await.context("Event aggregator task failed")?;

    let report = Report {
        summary,
        status,
        events: tallies.snapshot(),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to render report")?
    );
    Ok(())
}
