use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use modgate_core::ControlPlaneConfig;
use modgate_core::governor::{GovernorStats, ProcessSampler, ResourceGovernor};
use modgate_core::supervisor::{SupervisorStatus, WorkerSupervisor};
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "modgate")]
#[command(about = "Moderation control plane: supervised workers under resource governance")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker supervisor and resource governor until Ctrl-C
    Run {
        #[arg(long, value_name = "FILE")]
        config: PathBuf,

        /// How often to print a JSON status line
        #[arg(long, default_value_t = 5000)]
        status_interval_ms: u64,
    },
    /// Validate a config file and print it with defaults filled in
    CheckConfig {
        #[arg(value_name = "FILE")]
        config: PathBuf,
    },
}

#[derive(Serialize)]
struct StatusLine {
    timestamp: String,
    supervisor: SupervisorStatus,
    governor: GovernorStats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    match cli.command {
        Commands::Run {
            config,
            status_interval_ms,
        } => run(&config, Duration::from_millis(status_interval_ms.max(1))).await,
        Commands::CheckConfig { config } => {
            let config = load_config(&config)?;
            println!("{}", config.to_json_pretty()?);
            Ok(())
        }
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(fmt::layer().json().with_timer(UtcTime::rfc_3339()))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_timer(UtcTime::rfc_3339()))
            .try_init()
    };
    if let Err(error) = result {
        // a subscriber installed earlier keeps receiving events
        eprintln!("logging already initialised: {error}");
    }
}

fn load_config(path: &Path) -> Result<ControlPlaneConfig> {
    ControlPlaneConfig::from_path(path)
        .with_context(|| format!("loading config from {}", path.display()))
}

async fn run(config_path: &Path, status_interval: Duration) -> Result<()> {
    let config = load_config(config_path)?;
    if config.supervisor.command.is_none() {
        bail!("config has no supervisor.command; nothing to supervise");
    }

    let governor = Arc::new(ResourceGovernor::with_host_sampler(config.governor.clone())?);
    let supervisor = Arc::new(WorkerSupervisor::new(
        config.supervisor.clone(),
        process_executor()?,
    )?);

    supervisor.start()?;
    governor.start();
    let mut registered = BTreeSet::new();
    let mut processes = ProcessSampler::new();
    sync_workers(&supervisor, &governor, &mut processes, &mut registered);

    let mut ticker = tokio::time::interval(status_interval);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    tracing::error!(error = %error, "failed to listen for Ctrl-C");
                }
                break;
            }
            _ = ticker.tick() => {
                sync_workers(&supervisor, &governor, &mut processes, &mut registered);
                print_status(&supervisor, &governor)?;
            }
        }
    }

    tracing::info!("shutting down");
    supervisor.stop().await;
    governor.stop().await;
    print_status(&supervisor, &governor)?;
    Ok(())
}

/// Keeps the governor's worker registry in step with the live process table
/// and refreshes each worker's measured usage.
fn sync_workers(
    supervisor: &WorkerSupervisor,
    governor: &ResourceGovernor,
    processes: &mut ProcessSampler,
    registered: &mut BTreeSet<String>,
) {
    let workers = supervisor.running_workers();
    let running: BTreeSet<String> = workers
        .iter()
        .map(|worker| worker.worker_id.clone())
        .collect();

    for worker_id in running.difference(registered) {
        governor.register_worker(worker_id, governor.config().worker_quota.clone());
        tracing::debug!(worker_id = %worker_id, "worker registered with governor");
    }
    for worker in &workers {
        let Some(usage) = worker.pid.and_then(|pid| processes.sample(pid)) else {
            continue;
        };
        governor.update_worker_usage(&worker.worker_id, usage.cpu_percent, usage.memory_mb);
    }
    for worker_id in registered.difference(&running) {
        governor.unregister_worker(worker_id);
        tracing::debug!(worker_id = %worker_id, "worker unregistered from governor");
    }
    *registered = running;
}

fn print_status(supervisor: &WorkerSupervisor, governor: &ResourceGovernor) -> Result<()> {
    let line = StatusLine {
        timestamp: OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default(),
        supervisor: supervisor.get_status(),
        governor: governor.get_stats(),
    };
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}

#[cfg(unix)]
fn process_executor() -> Result<Arc<dyn modgate_core::execution::ProcessExecutor>> {
    Ok(Arc::new(modgate_core::execution::TokioProcessExecutor))
}

#[cfg(not(unix))]
fn process_executor() -> Result<Arc<dyn modgate_core::execution::ProcessExecutor>> {
    bail!("worker supervision is only supported on unix hosts")
}
