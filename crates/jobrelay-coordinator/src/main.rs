//! jobrelay simulation - runs a seeded workload through the dispatcher.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use jobrelay_core::{DispatchEventKind, Job, JobCompletionCriteria, JobStatus, Provider, ProviderId};
use jobrelay_coordinator::metrics::collect_metrics;
use jobrelay_coordinator::{
    BroadcastNotifier, Config, Coordinator, Dispatcher, HealthTracker, InMemoryStore,
    JobLifecycle, ProviderStore, SimulatedExecutor,
};

/// jobrelay - simulate job dispatch across providers
#[derive(Parser)]
#[command(name = "jobrelay-coordinator")]
#[command(about = "Run a simulated workload through the jobrelay coordinator", long_about = None)]
struct Cli {
    /// JSON config file (health, coordinator, dispatcher sections)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of providers
    #[arg(long, default_value_t = 3)]
    providers: usize,

    /// Number of jobs
    #[arg(long, default_value_t = 24)]
    jobs: usize,

    /// Number of projects the jobs are spread across
    #[arg(long, default_value_t = 8)]
    projects: usize,

    /// Failure probability for every provider but the first
    #[arg(long, default_value_t = 0.05)]
    failure_rate: f64,

    /// Failure probability for the first provider
    #[arg(long, default_value_t = 0.6)]
    flaky_failure_rate: f64,

    /// Retries allowed per job
    #[arg(long, default_value_t = 2)]
    max_retries: u32,

    /// Simulated execution latency range (ms)
    #[arg(long, default_value_t = 20)]
    min_latency_ms: u64,
    #[arg(long, default_value_t = 150)]
    max_latency_ms: u64,

    /// Override the per-provider concurrency cap
    #[arg(long)]
    max_jobs_per_provider: Option<u32>,

    /// Override the dispatcher tick interval (ms)
    #[arg(long)]
    tick_interval_ms: Option<u64>,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 120)]
    deadline_secs: u64,
}

fn load_config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("Failed to read config from '{}': {}", path.display(), e))?;
            Config::from_json(&text)?
        }
        None => Config::default(),
    };
    if let Some(max) = cli.max_jobs_per_provider {
        config.coordinator.max_jobs_per_provider = max;
    }
    config.dispatcher.tick_interval_ms = cli.tick_interval_ms.unwrap_or(50);
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let notifier = Arc::new(BroadcastNotifier::default());
    let mut events = notifier.subscribe();
    let event_log = tokio::spawn(async move {
        let mut transitions = 0usize;
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let DispatchEventKind::CircuitStateChanged { provider_id, from, to } = &event.kind {
                        info!(provider_id = %provider_id, from = %from, to = %to, "Circuit event");
                        transitions += 1;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
        transitions
    });

    let store = Arc::new(InMemoryStore::new());
    let health = Arc::new(HealthTracker::with_notifier(
        config.health.clone(),
        notifier.clone(),
    ));
    let coordinator = Arc::new(
        Coordinator::from_store(store.clone(), health.clone(), config.coordinator.clone())
            .with_notifier(notifier.clone()),
    );
    let lifecycle = Arc::new(JobLifecycle::new(store.clone()).with_notifier(notifier.clone()));

    let mut executor = SimulatedExecutor::new(
        cli.failure_rate,
        cli.min_latency_ms..cli.max_latency_ms.max(cli.min_latency_ms),
    );
    for i in 0..cli.providers {
        let id = ProviderId::new(format!("provider-{i}"));
        store
            .save_provider(&Provider::new(id.clone(), format!("sim-{i}")).with_kind("simulated"))
            .await?;
        if i == 0 {
            executor = executor.with_failure_rate(id, cli.flaky_failure_rate);
        }
    }

    let cancel = CancellationToken::new();
    for i in 0..cli.jobs {
        let job = Job::new(
            format!("project-{}", i % cli.projects.max(1)),
            format!("job {i}"),
            format!("simulated prompt {i}"),
        )
        .with_priority((i % 3) as i32)
        .with_max_retries(cli.max_retries);
        lifecycle.create_job(job, &cancel).await?;
    }

    info!(
        providers = cli.providers,
        jobs = cli.jobs,
        projects = cli.projects,
        "Starting simulation"
    );

    let dispatcher = Dispatcher::new(
        coordinator,
        lifecycle,
        store.clone(),
        Arc::new(executor),
        config.dispatcher.clone(),
    )
    .with_criteria(JobCompletionCriteria::quick_task());

    let deadline = cancel.clone();
    let deadline_secs = cli.deadline_secs;
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(deadline_secs)).await;
        warn!(deadline_secs, "Simulation deadline reached - cancelling");
        deadline.cancel();
    });

    let summary = dispatcher.run_until_idle(&cancel).await?;

    let metrics = collect_metrics(&health, store.as_ref()).await?;
    println!("{metrics}");

    // The event log ends once every sender is gone.
    drop(dispatcher);
    drop(health);
    drop(notifier);
    let circuit_transitions = event_log.await.unwrap_or_default();

    let jobs = store.all_jobs().await;
    let count = |status: JobStatus| jobs.iter().filter(|j| j.status() == status).count();
    let report = json!({
        "ticks": summary.ticks,
        "assignments": summary.assigned,
        "rebalanced": summary.rebalanced,
        "selection_timeouts": summary.selection_timeouts,
        "circuit_transitions": circuit_transitions,
        "jobs": {
            "completed": count(JobStatus::Completed),
            "failed": count(JobStatus::Failed),
            "cancelled": count(JobStatus::Cancelled),
            "unfinished": jobs.iter().filter(|j| !j.is_terminal()).count(),
        },
        "tokens": jobs.iter().fold(0u64, |sum, j| sum.saturating_add(j.total_tokens())),
        "cost_usd": jobs.iter().map(|j| j.cost_usd).sum::<f64>(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
