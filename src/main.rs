//! kube-replay - scenario runner
//!
//! Loads a scenario file and replays it against the embedded in-memory
//! cluster. Scheduler re-weight events go to the in-memory configuration
//! store unless `--scheduler-api` points at a real endpoint (e.g. a
//! kube-scheduler-simulator, or the bundled `mock-sched-api`).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kube_replay::cluster::{FakeCluster, FakeClusterOptions};
use kube_replay::schedcfg::{HttpSchedulerConfig, InMemorySchedulerConfig, SchedulerConfigApi};
use kube_replay::{Scenario, Simulation, SimulationOptions};

#[derive(Parser, Debug)]
#[command(name = "kube-replay")]
#[command(about = "Replay pod/scheduler event timelines and record scheduler behavior")]
struct Args {
    /// Path to the scenario file (YAML or JSON)
    #[arg(short, long)]
    scenario: PathBuf,

    /// Directory to write per-run artifacts into
    #[arg(short, long, default_value = "results")]
    output: PathBuf,

    /// Base URL of a scheduler-configuration endpoint. Without it,
    /// re-weight events apply to an in-memory configuration.
    #[arg(long)]
    scheduler_api: Option<String>,

    /// Artificial binding latency of the embedded cluster, in milliseconds
    #[arg(long, default_value = "20")]
    scheduling_delay_ms: u64,

    /// Reset scheduler plugin weights to their defaults before the run
    #[arg(long)]
    reset_weights: bool,

    /// Print the current plugin weights and exit
    #[arg(long)]
    show_weights: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("kube_replay=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let scheduler_config: Arc<dyn SchedulerConfigApi> = match &args.scheduler_api {
        Some(url) => {
            info!(url = %url, "using HTTP scheduler-configuration endpoint");
            Arc::new(HttpSchedulerConfig::new(url.clone()))
        }
        None => Arc::new(InMemorySchedulerConfig::default()),
    };

    if args.show_weights {
        let config = scheduler_config
            .get()
            .await
            .context("failed to fetch scheduler configuration")?;
        for (plugin, weight) in config.plugin_weights() {
            println!("{plugin}: {weight}");
        }
        return Ok(());
    }

    if args.reset_weights {
        scheduler_config
            .reset_to_defaults()
            .await
            .context("failed to reset plugin weights")?;
        info!("plugin weights reset to defaults");
    }

    let scenario = Scenario::from_file(&args.scenario).await?;

    let cluster = FakeCluster::new(FakeClusterOptions {
        scheduling_delay: Duration::from_millis(args.scheduling_delay_ms),
    });

    let simulation = Simulation::new(
        scenario,
        cluster,
        scheduler_config,
        SimulationOptions {
            output_root: args.output,
            ..Default::default()
        },
    );

    // Ctrl-C cancels the run cleanly; metrics are still exported.
    let ctx = CancellationToken::new();
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping simulation");
                ctx.cancel();
            }
        });
    }

    let output_dir = simulation.output_dir();
    simulation
        .run(ctx)
        .await
        .context("simulation aborted")?;

    info!(dir = %output_dir.display(), "done");
    Ok(())
}
