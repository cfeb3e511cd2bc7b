//! # kube-replay
//!
//! Replays a scenario — a cluster topology plus a timeline of pod
//! creations, evictions, and scheduler re-weights — against a
//! Kubernetes-compatible cluster, observes the resulting pod and node
//! state through watch streams, and writes time-series metrics as CSV.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         Simulation                            │
//! │  ┌─────────────────────────┐   ┌───────────────────────────┐  │
//! │  │ EventScheduler          │   │ Observer                  │  │
//! │  │ - min-heap of events    │   │ - pod + node watch tasks  │  │
//! │  │ - 100ms dispatch loop   │   │ - NodeState occupancy     │  │
//! │  │ - per-event timeout     │   │ - Stats histories         │  │
//! │  └───────────┬─────────────┘   └────────────┬──────────────┘  │
//! │              │  execute                     │  watch          │
//! │  ┌───────────▼──────────────────────────────▼──────────────┐  │
//! │  │ ClusterClient (live cluster or in-memory FakeCluster)   │  │
//! │  └─────────────────────────────────────────────────────────┘  │
//! │              │                                                │
//! │  ┌───────────▼─────────────┐   completion watcher gates the  │
//! │  │ SchedulerConfigApi      │   run on every duration-bounded │
//! │  │ (HTTP or in-memory)     │   pod being observed Deleted    │
//! │  └─────────────────────────┘                                 │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! A create-pod event creates the pod, waits for it to be observed
//! Running, and then schedules its own delete-pod event at
//! `elapsed + evictTime` — eviction delays are relative to the Running
//! observation, not to arrival.

pub mod api;
pub mod cluster;
pub mod controller;
pub mod events;
pub mod export;
pub mod observer;
pub mod queue;
pub mod scenario;
pub mod schedcfg;
pub mod scheduler;

pub use controller::{Simulation, SimulationError, SimulationOptions};
pub use events::{EventKind, EventStatus, ExecutionEnv, ScheduledEvent};
pub use observer::{Observer, Stats};
pub use scenario::Scenario;
pub use scheduler::{EventScheduler, SchedulerOptions};
