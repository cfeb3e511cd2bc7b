//! Cluster capability consumed by the replay engine.
//!
//! The engine never talks to a concrete API server directly; everything
//! goes through [`ClusterClient`]. The in-memory [`FakeCluster`] implements
//! the same contract for tests and sandboxed runs, and a live-cluster
//! implementation can be supplied by the embedding application.

mod fake;

pub use fake::{FakeCluster, FakeClusterOptions};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::api::{Node, Pod};

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{op} failed: {message}")]
    ApiCall { op: &'static str, message: String },

    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("watch stream closed")]
    WatchClosed,

    #[error("timed out waiting for pod {pod:?} to reach phase {phase}")]
    WaitTimeout { pod: String, phase: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

impl WatchEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchEventType::Added => "Added",
            WatchEventType::Modified => "Modified",
            WatchEventType::Deleted => "Deleted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchEvent<T> {
    pub event_type: WatchEventType,
    pub object: T,
}

/// One subscriber's view of a watch stream.
///
/// Backed by a broadcast channel so any number of consumers (observer,
/// completion watcher, in-flight create-pod events) can follow the same
/// stream independently. A lagged receiver skips ahead rather than failing;
/// a closed channel surfaces as [`ClusterError::WatchClosed`].
pub struct WatchSubscription<T: Clone> {
    rx: broadcast::Receiver<WatchEvent<T>>,
}

impl<T: Clone> WatchSubscription<T> {
    pub fn new(rx: broadcast::Receiver<WatchEvent<T>>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Result<WatchEvent<T>, ClusterError> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Ok(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "watch subscriber lagged, skipping ahead");
                }
                Err(RecvError::Closed) => return Err(ClusterError::WatchClosed),
            }
        }
    }
}

/// The operations the engine needs from a Kubernetes-compatible cluster.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create a pod; returns the stored object with server-assigned fields
    /// (uid, creation timestamp) filled in.
    async fn create_pod(&self, pod: Pod) -> Result<Pod, ClusterError>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    /// List pods; an empty namespace means all namespaces.
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, ClusterError>;

    async fn create_node(&self, node: Node) -> Result<Node, ClusterError>;

    async fn delete_node(&self, name: &str) -> Result<(), ClusterError>;

    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError>;

    /// Subscribe to pod events across all namespaces.
    fn watch_pods(&self) -> WatchSubscription<Pod>;

    fn watch_nodes(&self) -> WatchSubscription<Node>;
}
