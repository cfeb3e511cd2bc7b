//! Schedulable events and their execution contracts.
//!
//! An event is a fixed (id, arrival) pair plus a kind-specific payload.
//! Arrival offsets are durations from the scheduler's start instant and
//! never change once the event is queued; status moves monotonically
//! Pending -> Executing -> Completed/Failed, or Pending -> Canceled when an
//! event is removed from the queue before dispatch.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::api::Pod;
use crate::cluster::{ClusterClient, ClusterError, WatchEventType, WatchSubscription};
use crate::schedcfg::{SchedulerConfigApi, SchedulerConfigError};
use crate::scheduler::{EventScheduler, SchedulerError};

/// How long a created pod may take to reach Running before the event fails.
pub const DEFAULT_RUNNING_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid event: {0}")]
    Invalid(&'static str),

    #[error("event execution timed out")]
    Timeout,

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    SchedulerConfig(#[from] SchedulerConfigError),

    #[error(transparent)]
    Schedule(#[from] SchedulerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventStatus {
    Pending = 0,
    Executing = 1,
    Completed = 2,
    Failed = 3,
    Canceled = 4,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "Pending",
            EventStatus::Executing => "Executing",
            EventStatus::Completed => "Completed",
            EventStatus::Failed => "Failed",
            EventStatus::Canceled => "Canceled",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => EventStatus::Executing,
            2 => EventStatus::Completed,
            3 => EventStatus::Failed,
            4 => EventStatus::Canceled,
            _ => EventStatus::Pending,
        }
    }
}

/// Lock-free status field so inspectors never block an executing event.
#[derive(Debug)]
struct StatusCell(AtomicU8);

impl StatusCell {
    fn new() -> Self {
        Self(AtomicU8::new(EventStatus::Pending as u8))
    }

    fn get(&self) -> EventStatus {
        EventStatus::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, status: EventStatus) {
        self.0.store(status as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: EventStatus, to: EventStatus) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Everything an executing event may touch. Passed explicitly so events
/// hold no ambient state; the scheduler handle is what lets a CreatePod
/// enqueue its own DeletePod.
#[derive(Clone)]
pub struct ExecutionEnv {
    pub scheduler: EventScheduler,
    pub cluster: Arc<dyn ClusterClient>,
    pub scheduler_config: Arc<dyn SchedulerConfigApi>,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    CreatePod {
        pod: Pod,
        /// Delay from the pod's first observed Running phase to its
        /// deletion. Zero means the pod is never evicted by us.
        eviction: Duration,
        running_wait_timeout: Duration,
    },
    DeletePod {
        namespace: String,
        name: String,
    },
    Reweight {
        weights: BTreeMap<String, i32>,
    },
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CreatePod { .. } => "create-pod",
            EventKind::DeletePod { .. } => "delete-pod",
            EventKind::Reweight { .. } => "reweight",
        }
    }
}

#[derive(Debug)]
pub struct ScheduledEvent {
    pub id: String,
    pub arrival: Duration,
    pub kind: EventKind,
    /// Overrides the scheduler's default per-event execution timeout.
    pub execute_timeout: Option<Duration>,
    status: StatusCell,
}

impl ScheduledEvent {
    pub fn create_pod(id: impl Into<String>, arrival: Duration, eviction: Duration, pod: Pod) -> Self {
        Self::new(
            id,
            arrival,
            EventKind::CreatePod {
                pod,
                eviction,
                running_wait_timeout: DEFAULT_RUNNING_WAIT_TIMEOUT,
            },
        )
    }

    pub fn delete_pod(
        id: impl Into<String>,
        arrival: Duration,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            arrival,
            EventKind::DeletePod {
                namespace: namespace.into(),
                name: name.into(),
            },
        )
    }

    pub fn reweight(id: impl Into<String>, arrival: Duration, weights: BTreeMap<String, i32>) -> Self {
        Self::new(id, arrival, EventKind::Reweight { weights })
    }

    fn new(id: impl Into<String>, arrival: Duration, kind: EventKind) -> Self {
        let mut id = id.into();
        if id.is_empty() {
            id = Uuid::new_v4().to_string();
        }
        Self {
            id,
            arrival,
            kind,
            execute_timeout: None,
            status: StatusCell::new(),
        }
    }

    pub fn with_execute_timeout(mut self, timeout: Duration) -> Self {
        self.execute_timeout = Some(timeout);
        self
    }

    pub fn with_running_wait_timeout(mut self, timeout: Duration) -> Self {
        if let EventKind::CreatePod {
            running_wait_timeout,
            ..
        } = &mut self.kind
        {
            *running_wait_timeout = timeout;
        }
        self
    }

    pub fn status(&self) -> EventStatus {
        self.status.get()
    }

    /// Marks a queued event Canceled. No-op once execution has begun.
    pub fn cancel(&self) -> bool {
        self.status
            .transition(EventStatus::Pending, EventStatus::Canceled)
    }

    /// Marks an in-flight event Failed, e.g. after a timeout or context
    /// cancellation. Completed events stay Completed.
    pub fn fail_if_incomplete(&self) -> bool {
        self.status
            .transition(EventStatus::Executing, EventStatus::Failed)
    }

    /// Executes the event and records the terminal status.
    pub async fn run(&self, env: &ExecutionEnv) -> Result<(), EventError> {
        self.status.set(EventStatus::Executing);
        let result = self.execute(env).await;
        match &result {
            Ok(()) => {
                self.status
                    .transition(EventStatus::Executing, EventStatus::Completed);
            }
            Err(_) => {
                self.fail_if_incomplete();
            }
        }
        result
    }

    async fn execute(&self, env: &ExecutionEnv) -> Result<(), EventError> {
        match &self.kind {
            EventKind::CreatePod {
                pod,
                eviction,
                running_wait_timeout,
            } => {
                self.execute_create_pod(env, pod, *eviction, *running_wait_timeout)
                    .await
            }
            EventKind::DeletePod { namespace, name } => {
                env.cluster.delete_pod(namespace, name).await?;
                info!(event = %self.id, pod = %name, "pod deleted");
                Ok(())
            }
            EventKind::Reweight { weights } => {
                env.scheduler_config.update_weights(weights).await?;
                info!(event = %self.id, plugins = weights.len(), "scheduler weights updated");
                Ok(())
            }
        }
    }

    async fn execute_create_pod(
        &self,
        env: &ExecutionEnv,
        pod: &Pod,
        eviction: Duration,
        running_wait_timeout: Duration,
    ) -> Result<(), EventError> {
        if pod.spec.containers.is_empty() {
            return Err(EventError::Invalid("pod spec has no containers"));
        }

        // Subscribe before creating so a pod that is bound immediately
        // cannot slip past the watch.
        let watch = (!eviction.is_zero()).then(|| env.cluster.watch_pods());

        let created = env.cluster.create_pod(pod.clone()).await?;
        info!(event = %self.id, pod = %created.name(), "pod created");

        let Some(mut watch) = watch else {
            return Ok(());
        };

        let running = wait_for_running(&mut watch, created.name(), running_wait_timeout).await?;
        let started = env
            .scheduler
            .started_at()
            .ok_or(EventError::Schedule(SchedulerError::NotStarted))?;

        // Eviction is relative to the Running observation, not to arrival.
        let evict_at = started.elapsed() + eviction;
        let evict_event = ScheduledEvent::delete_pod(
            format!("evict-{}", running.name()),
            evict_at,
            running.metadata.namespace.clone(),
            running.metadata.name.clone(),
        );
        debug!(
            event = %self.id,
            pod = %running.name(),
            evict_at_secs = evict_at.as_secs_f64(),
            "pod running, eviction scheduled"
        );
        env.scheduler.schedule(Arc::new(evict_event))?;
        Ok(())
    }
}

async fn wait_for_running(
    watch: &mut WatchSubscription<Pod>,
    name: &str,
    wait_timeout: Duration,
) -> Result<Pod, ClusterError> {
    let wait = async {
        loop {
            let event = watch.recv().await?;
            if event.event_type != WatchEventType::Deleted
                && event.object.name() == name
                && event.object.phase() == crate::api::PodPhase::Running
            {
                return Ok(event.object);
            }
        }
    };

    match tokio::time::timeout(wait_timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(ClusterError::WaitTimeout {
            pod: name.to_string(),
            phase: "Running",
        }),
    }
}
