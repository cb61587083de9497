//! Coalesce script runner.
//!
//! Runs a request script against the simulated backend and logs what every
//! request resolved to.
//!
//! # Usage
//!
//! ```bash
//! # Two opens in one batch: only the second connects
//! coalesce --script "open 0; open 0; wait"
//!
//! # Script file, flaky backend, verbose worker logs
//! coalesce --file demo.txt --failure-rate 0.3 --seed 7 --log-level debug
//! ```

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use coalesce_core::TableSnapshot;
use coalesce_harness::{
    InvariantRegistry, Script, ScriptRunner, SimBackend, SimConfig, SystemSnapshot,
    affected_resources,
};
use coalesce_runtime::{QueueConfig, ResourceQueue, RetryPolicy};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Coalesce request queue simulator
#[derive(Parser, Debug)]
#[command(name = "coalesce")]
#[command(about = "Run a request script against a simulated resource backend")]
#[command(version)]
struct Args {
    /// Script source, statements separated by `;` or newlines
    #[arg(short, long, conflicts_with = "file", required_unless_present = "file")]
    script: Option<String>,

    /// Read the script from a file
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Request backlog size
    #[arg(long, default_value = "64")]
    capacity: usize,

    /// Idle time before an unused resource is closed, in milliseconds
    #[arg(long, default_value = "3000")]
    idle_ms: u64,

    /// Wake lock check interval, in milliseconds
    #[arg(long, default_value = "100")]
    tick_ms: u64,

    /// Open attempts for transient failures, first attempt included
    #[arg(long, default_value = "3")]
    attempts: u32,

    /// Base delay between open attempts, in milliseconds
    #[arg(long, default_value = "50")]
    backoff_ms: u64,

    /// Simulated open latency, in milliseconds
    #[arg(long, default_value = "5")]
    latency_ms: u64,

    /// Probability that a simulated open fails transiently
    #[arg(long, default_value = "0.0", value_parser = probability)]
    failure_rate: f64,

    /// Seed for simulated failures
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            capacity: self.capacity,
            idle_timeout: Duration::from_millis(self.idle_ms),
            tick_interval: Duration::from_millis(self.tick_ms),
            retry: RetryPolicy {
                max_attempts: self.attempts,
                backoff: Duration::from_millis(self.backoff_ms),
            },
        }
    }

    fn sim_config(&self) -> SimConfig {
        SimConfig {
            latency: Duration::from_millis(self.latency_ms),
            failure_rate: self.failure_rate,
            seed: self.seed,
        }
    }

    fn source(&self) -> std::io::Result<String> {
        match (&self.script, &self.file) {
            (Some(script), _) => Ok(script.clone()),
            (None, Some(path)) => std::fs::read_to_string(path),
            (None, None) => Ok(String::new()),
        }
    }
}

fn probability(value: &str) -> Result<f64, String> {
    let rate: f64 = value.parse().map_err(|err| format!("{err}"))?;
    if (0.0..=1.0).contains(&rate) {
        Ok(rate)
    } else {
        Err(format!("{value} is not a probability between 0 and 1"))
    }
}

fn log_table(table: &TableSnapshot) {
    if table.is_empty() {
        tracing::info!("nothing open");
    }
    for active in &table.active {
        tracing::info!(
            handle = %active.handle,
            leases = active.leases,
            idle = active.idle,
            shared = active.shared.is_shared(),
            "active"
        );
    }
    for parked in &table.pending {
        tracing::info!(ticket = %parked.ticket, resource = %parked.open.resource, "parked");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let script = Script::parse(&args.source()?)?;
    tracing::info!(steps = script.steps().len(), "running script");

    let backend = SimBackend::new(args.sim_config());
    let inspector = backend.inspector();
    let (queue, worker) = ResourceQueue::spawn(backend, args.queue_config())?;

    let mut runner = ScriptRunner::new(queue);
    runner.run(&script).await;

    for line in runner.transcript().lines() {
        tracing::info!("{line}");
    }

    let table = runner.queue().snapshot();
    log_table(&table);

    let snapshot = SystemSnapshot::capture(table, &inspector);
    if let Err(violations) = InvariantRegistry::standard().check_all(&snapshot) {
        for violation in &violations {
            tracing::error!(%violation, "invariant violated");
        }
        tracing::error!(
            resources = ?affected_resources(&violations),
            %snapshot,
            "table inconsistent"
        );
    }

    tracing::info!(
        opens = inspector.opens(),
        closes = inspector.closes(),
        "backend totals before shutdown"
    );

    drop(runner);
    worker.await?;

    Ok(())
}
