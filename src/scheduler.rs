//! Virtual-time event scheduler.
//!
//! Owns the priority queue and a tick-based dispatch loop that releases
//! events once their arrival offset has elapsed since `start`. Producers
//! may schedule from any task, including from inside an executing event,
//! which is how a create-pod event enqueues its own eviction.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EventError, EventStatus, ExecutionEnv, ScheduledEvent};
use crate::queue::{EventQueue, QueueError};

pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_millis(100);
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler already started")]
    AlreadyStarted,

    #[error("scheduler not started")]
    NotStarted,

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub tick_period: Duration,
    /// Default execution timeout; events may override it individually.
    pub event_timeout: Duration,
    /// Queue capacity, 0 for unbounded.
    pub queue_capacity: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            tick_period: DEFAULT_TICK_PERIOD,
            event_timeout: DEFAULT_EVENT_TIMEOUT,
            queue_capacity: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopped,
}

struct Lifecycle {
    phase: Phase,
    started_at: Option<Instant>,
    stop: Option<CancellationToken>,
}

struct SchedulerInner {
    queue: EventQueue,
    lifecycle: Mutex<Lifecycle>,
    options: SchedulerOptions,
}

/// Cloneable handle; all clones share the same queue and lifecycle.
#[derive(Clone)]
pub struct EventScheduler {
    inner: Arc<SchedulerInner>,
}

impl Default for EventScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventScheduler {
    pub fn new() -> Self {
        Self::with_options(SchedulerOptions::default())
    }

    pub fn with_options(options: SchedulerOptions) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                queue: EventQueue::with_capacity(options.queue_capacity),
                lifecycle: Mutex::new(Lifecycle {
                    phase: Phase::Idle,
                    started_at: None,
                    stop: None,
                }),
                options,
            }),
        }
    }

    /// Records the start instant and spawns the dispatch loop.
    ///
    /// Events dispatched by the loop execute under `ctx`: cancelling it
    /// stops the loop and cancels in-flight executions, while [`stop`]
    /// only ends dispatching.
    ///
    /// [`stop`]: EventScheduler::stop
    pub fn start(&self, ctx: CancellationToken, env: ExecutionEnv) -> Result<(), SchedulerError> {
        let (started_at, stop) = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.phase != Phase::Idle {
                return Err(SchedulerError::AlreadyStarted);
            }
            let started_at = Instant::now();
            let stop = ctx.child_token();
            lifecycle.phase = Phase::Running;
            lifecycle.started_at = Some(started_at);
            lifecycle.stop = Some(stop.clone());
            (started_at, stop)
        };

        info!(queued = self.inner.queue.len(), "starting event scheduler");
        tokio::spawn(dispatch_loop(self.clone(), started_at, ctx, stop, env));
        Ok(())
    }

    /// Stops dispatching. In-flight executions keep running until they
    /// finish or the start context is cancelled.
    pub fn stop(&self) -> Result<(), SchedulerError> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.phase != Phase::Running {
            return Err(SchedulerError::NotStarted);
        }
        lifecycle.phase = Phase::Stopped;
        if let Some(stop) = lifecycle.stop.take() {
            stop.cancel();
        }
        info!("event scheduler stopped");
        Ok(())
    }

    /// Queues an event. Valid while idle (pre-loaded timelines) and while
    /// running (events produced in flight); arrivals already in the past
    /// dispatch on the next tick.
    pub fn schedule(&self, event: Arc<ScheduledEvent>) -> Result<(), SchedulerError> {
        if self.lifecycle().phase == Phase::Stopped {
            return Err(SchedulerError::NotStarted);
        }
        debug!(
            event = %event.id,
            kind = event.kind.as_str(),
            arrival_secs = event.arrival.as_secs_f64(),
            "event scheduled"
        );
        self.inner.queue.push(event)?;
        Ok(())
    }

    /// Cancels and removes a still-queued event.
    pub fn unschedule(&self, id: &str) -> Result<(), SchedulerError> {
        self.inner.queue.remove(id)?;
        Ok(())
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.lifecycle().started_at
    }

    /// Remaining queued events in dispatch order.
    pub fn snapshot(&self) -> Vec<Arc<ScheduledEvent>> {
        self.inner.queue.snapshot()
    }

    pub fn pending_events(&self) -> usize {
        self.inner.queue.len()
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.inner
            .lifecycle
            .lock()
            .expect("scheduler lifecycle lock poisoned")
    }
}

async fn dispatch_loop(
    scheduler: EventScheduler,
    started_at: Instant,
    ctx: CancellationToken,
    stop: CancellationToken,
    env: ExecutionEnv,
) {
    let mut tick = tokio::time::interval(scheduler.inner.options.tick_period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                debug!("dispatch loop exiting");
                return;
            }
            _ = tick.tick() => {
                let elapsed = started_at.elapsed();
                while let Some(event) = scheduler.inner.queue.pop_due(elapsed) {
                    if event.status() == EventStatus::Canceled {
                        continue;
                    }
                    debug!(
                        event = %event.id,
                        kind = event.kind.as_str(),
                        arrival_secs = event.arrival.as_secs_f64(),
                        elapsed_secs = elapsed.as_secs_f64(),
                        "dispatching event"
                    );
                    spawn_execution(
                        event,
                        env.clone(),
                        ctx.clone(),
                        scheduler.inner.options.event_timeout,
                    );
                }
            }
        }
    }
}

/// Runs one event concurrently with the loop and with other events,
/// bounded by the per-event timeout and the shared context.
fn spawn_execution(
    event: Arc<ScheduledEvent>,
    env: ExecutionEnv,
    ctx: CancellationToken,
    default_timeout: Duration,
) {
    let limit = event.execute_timeout.unwrap_or(default_timeout);
    tokio::spawn(async move {
        tokio::select! {
            _ = ctx.cancelled() => {
                if event.fail_if_incomplete() {
                    warn!(event = %event.id, "event canceled mid-execution");
                }
            }
            result = tokio::time::timeout(limit, event.run(&env)) => match result {
                Ok(Ok(())) => debug!(event = %event.id, "event completed"),
                Ok(Err(error)) => warn!(event = %event.id, %error, "event failed"),
                Err(_) => {
                    event.fail_if_incomplete();
                    warn!(
                        event = %event.id,
                        timeout_secs = limit.as_secs_f64(),
                        error = %EventError::Timeout,
                        "event execution timed out"
                    );
                }
            }
        }
    });
}
