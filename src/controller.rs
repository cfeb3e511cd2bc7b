//! Simulation controller: binds a scenario to the scheduler and observer,
//! drives the pod lifecycle, detects completion, and exports metrics.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::{
    ClusterClient, ClusterError, WatchEventType, WatchSubscription,
};
use crate::events::{ExecutionEnv, ScheduledEvent, DEFAULT_RUNNING_WAIT_TIMEOUT};
use crate::export::{export_stats, write_run_info, ExportError};
use crate::observer::{Observer, Stats};
use crate::scenario::Scenario;
use crate::schedcfg::SchedulerConfigApi;
use crate::scheduler::{EventScheduler, SchedulerError, DEFAULT_EVENT_TIMEOUT};

const OBSERVER_SETTLE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("simulation already running")]
    AlreadyRunning,

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Export(#[from] ExportError),
}

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// Artifacts land in `<output_root>/<simulation id>/`.
    pub output_root: PathBuf,
    pub event_timeout: Duration,
    pub running_wait_timeout: Duration,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("results"),
            event_timeout: DEFAULT_EVENT_TIMEOUT,
            running_wait_timeout: DEFAULT_RUNNING_WAIT_TIMEOUT,
        }
    }
}

pub struct Simulation {
    pub id: String,
    scenario: Scenario,
    scheduler: EventScheduler,
    observer: Observer,
    cluster: Arc<dyn ClusterClient>,
    scheduler_config: Arc<dyn SchedulerConfigApi>,
    options: SimulationOptions,
    running: AtomicBool,
}

impl Simulation {
    pub fn new(
        scenario: Scenario,
        cluster: Arc<dyn ClusterClient>,
        scheduler_config: Arc<dyn SchedulerConfigApi>,
        options: SimulationOptions,
    ) -> Self {
        let id = format!(
            "sim-{}-{}",
            sanitize(&scenario.metadata.name),
            Utc::now().format("%Y%m%d%H%M%S")
        );
        Self {
            id,
            observer: Observer::new(Arc::clone(&cluster)),
            scheduler: EventScheduler::new(),
            scenario,
            cluster,
            scheduler_config,
            options,
            running: AtomicBool::new(false),
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        self.options.output_root.join(&self.id)
    }

    pub fn scheduler(&self) -> &EventScheduler {
        &self.scheduler
    }

    pub fn observer(&self) -> &Observer {
        &self.observer
    }

    /// Runs the scenario to completion.
    ///
    /// Returns once every duration-bounded pod has been observed Deleted,
    /// `ctx` is cancelled (a clean stop), or a subsystem reports a fatal
    /// error. Metrics are exported in every case.
    pub async fn run(&self, ctx: CancellationToken) -> Result<Stats, SimulationError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SimulationError::AlreadyRunning);
        }

        let started_at = Utc::now();
        info!(simulation = %self.id, "starting simulation");
        self.scenario.describe();

        let (err_tx, mut err_rx) = mpsc::unbounded_channel::<ClusterError>();

        // Subscribe before anything can be deleted so the completion
        // watcher cannot miss an early eviction.
        let completion_watch = self.cluster.watch_pods();

        for node in &self.scenario.cluster.nodes {
            self.cluster.create_node(node.clone()).await?;
        }

        self.schedule_scenario_events()?;

        let pending: HashSet<String> = self.scenario.completion_pod_names().into_iter().collect();
        info!(
            gating_pods = pending.len(),
            queued_events = self.scheduler.pending_events(),
            "scenario scheduled"
        );

        self.observer.start(err_tx.clone());

        let env = ExecutionEnv {
            scheduler: self.scheduler.clone(),
            cluster: Arc::clone(&self.cluster),
            scheduler_config: Arc::clone(&self.scheduler_config),
        };
        self.scheduler.start(ctx.clone(), env)?;

        let watcher_stop = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(completion_watcher(
            completion_watch,
            pending,
            done_tx,
            err_tx,
            watcher_stop.clone(),
        ));

        let outcome = tokio::select! {
            _ = done_rx => {
                info!(simulation = %self.id, "all gated pods deleted, simulation complete");
                Ok(())
            }
            _ = ctx.cancelled() => {
                info!(simulation = %self.id, "simulation cancelled");
                Ok(())
            }
            Some(e) = err_rx.recv() => {
                error!(simulation = %self.id, error = %e, "fatal subsystem error");
                Err(SimulationError::Cluster(e))
            }
        };

        watcher_stop.cancel();
        if let Err(e) = self.scheduler.stop() {
            warn!(error = %e, "stopping scheduler");
        }
        // The completion signal and the observer read the same stream
        // independently; let the observer catch up on events already
        // delivered before freezing the stats.
        tokio::time::sleep(OBSERVER_SETTLE).await;
        self.observer.stop();

        let stats = self.observer.stats_snapshot();
        let dir = self.output_dir();
        let export = export_stats(&dir, &stats).and_then(|()| {
            write_run_info(
                &dir,
                &self.id,
                &self.scenario.metadata.name,
                started_at,
                &self.scenario.cluster.nodes,
            )
        });
        match export {
            Ok(()) => info!(simulation = %self.id, dir = %dir.display(), "metrics exported"),
            Err(e) => {
                warn!(simulation = %self.id, error = %e, "metrics export failed");
                outcome?;
                return Err(e.into());
            }
        }

        outcome?;
        Ok(stats)
    }

    fn schedule_scenario_events(&self) -> Result<(), SchedulerError> {
        for spec in &self.scenario.events.pods {
            let execute_timeout = spec
                .execute_timeout
                .map(|d| d.duration())
                .unwrap_or_else(|| {
                    if spec.evict_time.is_zero() {
                        self.options.event_timeout
                    } else {
                        // Creating plus waiting for Running must fit in one
                        // execution.
                        self.options.running_wait_timeout + self.options.event_timeout
                    }
                });

            let event = ScheduledEvent::create_pod(
                spec.name.clone(),
                spec.arrival_time.duration(),
                spec.evict_time.duration(),
                spec.pod_spec.clone(),
            )
            .with_running_wait_timeout(self.options.running_wait_timeout)
            .with_execute_timeout(execute_timeout);
            self.scheduler.schedule(Arc::new(event))?;
        }

        for (index, spec) in self.scenario.events.scheduler.iter().enumerate() {
            let id = if spec.name.is_empty() {
                format!("reweight-{index}")
            } else {
                spec.name.clone()
            };
            let event =
                ScheduledEvent::reweight(id, spec.arrival_time.duration(), spec.weights.clone());
            self.scheduler.schedule(Arc::new(event))?;
        }

        Ok(())
    }
}

/// Watches pod deletions and signals once every gated pod is gone.
async fn completion_watcher(
    mut watch: WatchSubscription<crate::api::Pod>,
    mut pending: HashSet<String>,
    done: oneshot::Sender<()>,
    err_tx: mpsc::UnboundedSender<ClusterError>,
    stop: CancellationToken,
) {
    if pending.is_empty() {
        let _ = done.send(());
        return;
    }

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            result = watch.recv() => match result {
                Ok(event) => {
                    if event.event_type == WatchEventType::Deleted
                        && pending.remove(event.object.name())
                    {
                        debug!(
                            pod = %event.object.name(),
                            remaining = pending.len(),
                            "gated pod deleted"
                        );
                        if pending.is_empty() {
                            let _ = done.send(());
                            return;
                        }
                    }
                }
                Err(e) => {
                    if !stop.is_cancelled() {
                        let _ = err_tx.send(e);
                    }
                    return;
                }
            }
        }
    }
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{FakeCluster, FakeClusterOptions};
    use crate::schedcfg::InMemorySchedulerConfig;

    fn simulation(scenario: Scenario, dir: &std::path::Path) -> Simulation {
        Simulation::new(
            scenario,
            FakeCluster::new(FakeClusterOptions::default()),
            Arc::new(InMemorySchedulerConfig::default()),
            SimulationOptions {
                output_root: dir.to_path_buf(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn id_is_derived_from_the_scenario_name() {
        let dir = tempfile::tempdir().unwrap();
        let scenario = Scenario {
            metadata: crate::scenario::Metadata {
                name: "my scenario/1".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let sim = simulation(scenario, dir.path());
        assert!(sim.id.starts_with("sim-my-scenario-1-"), "id: {}", sim.id);
    }

    #[tokio::test]
    async fn empty_scenario_completes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let scenario = Scenario {
            metadata: crate::scenario::Metadata {
                name: "empty".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let sim = simulation(scenario, dir.path());

        let stats = tokio::time::timeout(
            Duration::from_secs(5),
            sim.run(CancellationToken::new()),
        )
        .await
        .expect("empty scenario should complete promptly")
        .unwrap();

        assert!(stats.pending_durations.is_empty());
        assert!(sim.output_dir().join("event_history.csv").exists());
        assert!(sim.output_dir().join("simulation_info.txt").exists());
    }

    #[tokio::test]
    async fn a_second_run_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let scenario = Scenario {
            metadata: crate::scenario::Metadata {
                name: "twice".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let sim = simulation(scenario, dir.path());

        sim.run(CancellationToken::new()).await.unwrap();
        let err = sim.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SimulationError::AlreadyRunning));
    }
}
