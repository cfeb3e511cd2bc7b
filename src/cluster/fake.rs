//! In-memory cluster used by tests and sandboxed runs.
//!
//! Behaves like a tiny API server plus a first-fit scheduler: created pods
//! start out Pending, a background assignment task binds them to the first
//! node with room for their first container's requests, and deletions free
//! the node and trigger a rescheduling pass. Every mutation is published on
//! broadcast watch streams exactly like a real watch would deliver it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::api::{Node, Pod, PodPhase, Quantity, RESOURCE_PODS};
use crate::cluster::{
    ClusterClient, ClusterError, WatchEvent, WatchEventType, WatchSubscription,
};

const WATCH_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
pub struct FakeClusterOptions {
    /// Artificial latency between a pod becoming schedulable and the
    /// assignment pass that binds it. Keeps Pending observable and gives
    /// watchers opened right after `create_pod` time to attach.
    pub scheduling_delay: Duration,
}

impl Default for FakeClusterOptions {
    fn default() -> Self {
        Self {
            scheduling_delay: Duration::from_millis(20),
        }
    }
}

struct State {
    nodes: BTreeMap<String, Node>,
    pods: BTreeMap<String, Pod>,
}

struct Inner {
    state: Mutex<State>,
    pod_tx: broadcast::Sender<WatchEvent<Pod>>,
    node_tx: broadcast::Sender<WatchEvent<Node>>,
    kick: Notify,
}

pub struct FakeCluster {
    inner: Arc<Inner>,
    stop: CancellationToken,
}

impl FakeCluster {
    pub fn new(options: FakeClusterOptions) -> Arc<Self> {
        let (pod_tx, _) = broadcast::channel(WATCH_BUFFER);
        let (node_tx, _) = broadcast::channel(WATCH_BUFFER);

        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                nodes: BTreeMap::new(),
                pods: BTreeMap::new(),
            }),
            pod_tx,
            node_tx,
            kick: Notify::new(),
        });

        let stop = CancellationToken::new();
        tokio::spawn(assignment_loop(
            Arc::clone(&inner),
            stop.clone(),
            options.scheduling_delay,
        ));

        Arc::new(Self { inner, stop })
    }

    fn pod_key(namespace: &str, name: &str) -> String {
        format!("{namespace}/{name}")
    }
}

impl Drop for FakeCluster {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Binds pending pods to nodes until nothing else fits, then waits for the
/// next state change.
async fn assignment_loop(inner: Arc<Inner>, stop: CancellationToken, delay: Duration) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = inner.kick.notified() => {}
        }

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        while let Some(pod) = assign_one(&inner) {
            debug!(pod = %pod.name(), node = %pod.node_name(), "fake cluster bound pod");
            let _ = inner.pod_tx.send(WatchEvent {
                event_type: WatchEventType::Modified,
                object: pod,
            });
        }
    }
}

/// Binds the oldest pending pod that fits on some node. Nodes are tried in
/// name order, pods in creation order, which makes runs reproducible.
fn assign_one(inner: &Inner) -> Option<Pod> {
    let mut state = inner.state.lock().expect("fake cluster state poisoned");
    let state = &mut *state;

    let mut pending: Vec<(Option<chrono::DateTime<Utc>>, String)> = state
        .pods
        .iter()
        .filter(|(_, p)| p.node_name().is_empty() && p.phase() == PodPhase::Pending)
        .map(|(key, p)| (p.metadata.creation_timestamp, key.clone()))
        .collect();
    pending.sort();

    for (_, key) in pending {
        let requests = state
            .pods
            .get(&key)
            .map(|p| p.first_container_requests())
            .unwrap_or_default();
        let target = state
            .nodes
            .values()
            .find(|node| fits(node, &state.pods, &requests))
            .map(|node| node.name().to_string());

        if let Some(node_name) = target {
            let bound = state.pods.get_mut(&key).expect("pending pod vanished");
            bound.spec.node_name = node_name;
            bound.status.phase = PodPhase::Running;
            return Some(bound.clone());
        }
    }

    None
}

fn fits(
    node: &Node,
    pods: &BTreeMap<String, Pod>,
    requests: &BTreeMap<String, Quantity>,
) -> bool {
    let assigned: Vec<&Pod> = pods
        .values()
        .filter(|p| p.node_name() == node.name())
        .collect();

    if let Some(max_pods) = node.status.allocatable.get(RESOURCE_PODS) {
        if assigned.len() as i64 + 1 > max_pods.value() {
            return false;
        }
    }

    for (resource, request) in requests {
        let Some(allocatable) = node.status.allocatable.get(resource) else {
            continue;
        };
        let used: i64 = assigned
            .iter()
            .map(|p| p.request(resource).milli_value())
            .sum();
        if used + request.milli_value() > allocatable.milli_value() {
            return false;
        }
    }

    true
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn create_pod(&self, mut pod: Pod) -> Result<Pod, ClusterError> {
        let key = Self::pod_key(&pod.metadata.namespace, &pod.metadata.name);

        pod.metadata.uid = Uuid::new_v4().to_string();
        pod.metadata.creation_timestamp = Some(Utc::now());
        pod.status.phase = PodPhase::Pending;

        {
            let mut state = self.inner.state.lock().expect("fake cluster state poisoned");
            if state.pods.contains_key(&key) {
                return Err(ClusterError::AlreadyExists {
                    kind: "pod",
                    name: pod.metadata.name,
                });
            }
            state.pods.insert(key, pod.clone());
        }

        let _ = self.inner.pod_tx.send(WatchEvent {
            event_type: WatchEventType::Added,
            object: pod.clone(),
        });
        self.inner.kick.notify_one();
        Ok(pod)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let key = Self::pod_key(namespace, name);
        let removed = {
            let mut state = self.inner.state.lock().expect("fake cluster state poisoned");
            state.pods.remove(&key)
        };

        let Some(pod) = removed else {
            return Err(ClusterError::NotFound {
                kind: "pod",
                name: name.to_string(),
            });
        };

        let _ = self.inner.pod_tx.send(WatchEvent {
            event_type: WatchEventType::Deleted,
            object: pod,
        });
        self.inner.kick.notify_one();
        Ok(())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, ClusterError> {
        let state = self.inner.state.lock().expect("fake cluster state poisoned");
        Ok(state
            .pods
            .values()
            .filter(|p| namespace.is_empty() || p.metadata.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn create_node(&self, mut node: Node) -> Result<Node, ClusterError> {
        node.metadata.uid = Uuid::new_v4().to_string();
        node.metadata.creation_timestamp = Some(Utc::now());
        if node.status.allocatable.is_empty() {
            node.status.allocatable = node.status.capacity.clone();
        }

        {
            let mut state = self.inner.state.lock().expect("fake cluster state poisoned");
            if state.nodes.contains_key(node.name()) {
                return Err(ClusterError::AlreadyExists {
                    kind: "node",
                    name: node.metadata.name,
                });
            }
            state.nodes.insert(node.name().to_string(), node.clone());
        }

        let _ = self.inner.node_tx.send(WatchEvent {
            event_type: WatchEventType::Added,
            object: node.clone(),
        });
        self.inner.kick.notify_one();
        Ok(node)
    }

    async fn delete_node(&self, name: &str) -> Result<(), ClusterError> {
        let removed = {
            let mut state = self.inner.state.lock().expect("fake cluster state poisoned");
            state.nodes.remove(name)
        };

        let Some(node) = removed else {
            return Err(ClusterError::NotFound {
                kind: "node",
                name: name.to_string(),
            });
        };

        let _ = self.inner.node_tx.send(WatchEvent {
            event_type: WatchEventType::Deleted,
            object: node,
        });
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
        let state = self.inner.state.lock().expect("fake cluster state poisoned");
        Ok(state.nodes.values().cloned().collect())
    }

    fn watch_pods(&self) -> WatchSubscription<Pod> {
        WatchSubscription::new(self.inner.pod_tx.subscribe())
    }

    fn watch_nodes(&self) -> WatchSubscription<Node> {
        WatchSubscription::new(self.inner.node_tx.subscribe())
    }
}
