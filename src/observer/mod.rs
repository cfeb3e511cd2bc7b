//! Cluster observer: consumes pod and node watch streams and maintains the
//! derived occupancy state and statistics.
//!
//! All mutations funnel through one lock so that, for any given pod, the
//! node cache and the stats always agree. Readers get deep copies.

mod node_state;
mod stats;

pub use node_state::NodeState;
pub use stats::{PodEventRecord, Record, Stats};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::api::{Node, ObjectKey, Pod, PodPhase};
use crate::cluster::{ClusterClient, ClusterError, WatchEvent, WatchEventType};

/// Everything the observer has derived from the watch streams.
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    pub nodes: HashMap<String, NodeState>,
    pub stats: Stats,
    /// Last seen object per pod, kept to diff Modified events against.
    tracked: HashMap<ObjectKey, Pod>,
}

struct ObserverInner {
    cluster: Arc<dyn ClusterClient>,
    view: Mutex<ClusterView>,
    stop: CancellationToken,
    started: AtomicBool,
}

#[derive(Clone)]
pub struct Observer {
    inner: Arc<ObserverInner>,
}

impl Observer {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self {
            inner: Arc::new(ObserverInner {
                cluster,
                view: Mutex::new(ClusterView::default()),
                stop: CancellationToken::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribes to the pod and node streams and starts routing events.
    /// A closed watch is terminal for the observer and is reported on
    /// `err_tx`; the controller decides whether to abort the run.
    pub fn start(&self, err_tx: mpsc::UnboundedSender<ClusterError>) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!("observer already started");
            return;
        }

        tokio::spawn(consume_nodes(Arc::clone(&self.inner), err_tx.clone()));
        tokio::spawn(consume_pods(Arc::clone(&self.inner), err_tx));
    }

    /// Stops the consumers and takes one final history sample per node so
    /// exported series end with the state at shutdown.
    pub fn stop(&self) {
        self.inner.stop.cancel();

        let mut view = self.lock_view();
        let ClusterView { nodes, stats, .. } = &mut *view;
        for node in nodes.values() {
            stats.update_history(node);
        }
    }

    pub fn snapshot(&self) -> ClusterView {
        self.lock_view().clone()
    }

    pub fn stats_snapshot(&self) -> Stats {
        self.lock_view().stats.clone()
    }

    fn lock_view(&self) -> std::sync::MutexGuard<'_, ClusterView> {
        self.inner.view.lock().expect("observer view lock poisoned")
    }
}

async fn consume_pods(inner: Arc<ObserverInner>, err_tx: mpsc::UnboundedSender<ClusterError>) {
    let mut sub = inner.cluster.watch_pods();
    loop {
        tokio::select! {
            _ = inner.stop.cancelled() => return,
            result = sub.recv() => match result {
                Ok(event) => handle_pod_event(&inner, event),
                Err(e) => {
                    if !inner.stop.is_cancelled() {
                        error!(error = %e, "pod watch ended");
                        let _ = err_tx.send(e);
                    }
                    return;
                }
            }
        }
    }
}

async fn consume_nodes(inner: Arc<ObserverInner>, err_tx: mpsc::UnboundedSender<ClusterError>) {
    let mut sub = inner.cluster.watch_nodes();
    loop {
        tokio::select! {
            _ = inner.stop.cancelled() => return,
            result = sub.recv() => match result {
                Ok(event) => handle_node_event(&inner, event),
                Err(e) => {
                    if !inner.stop.is_cancelled() {
                        error!(error = %e, "node watch ended");
                        let _ = err_tx.send(e);
                    }
                    return;
                }
            }
        }
    }
}

fn handle_node_event(inner: &ObserverInner, event: WatchEvent<Node>) {
    let mut view = inner.view.lock().expect("observer view lock poisoned");
    let ClusterView { nodes, stats, .. } = &mut *view;
    let node = event.object;

    match event.event_type {
        WatchEventType::Added => {
            debug!(node = %node.name(), "node added");
            let state = NodeState::new(node);
            stats.update_history(&state);
            nodes.insert(state.node.name().to_string(), state);
        }
        WatchEventType::Modified => match nodes.get_mut(node.name()) {
            Some(state) => {
                state.update_node(node);
                stats.update_history(state);
            }
            None => {
                let state = NodeState::new(node);
                stats.update_history(&state);
                nodes.insert(state.node.name().to_string(), state);
            }
        },
        WatchEventType::Deleted => {
            debug!(node = %node.name(), "node removed");
            nodes.remove(node.name());
        }
    }
}

fn handle_pod_event(inner: &ObserverInner, event: WatchEvent<Pod>) {
    let mut view = inner.view.lock().expect("observer view lock poisoned");
    let ClusterView {
        nodes,
        stats,
        tracked,
    } = &mut *view;
    let pod = event.object;
    let key = pod.key();

    stats.record_pod_event(&pod, event.event_type);

    match event.event_type {
        WatchEventType::Added => {
            if pod.phase() == PodPhase::Pending {
                debug!(pod = %pod.name(), "pod added to pending queue");
                stats.push_pending(&pod);
            }
            if !pod.node_name().is_empty() {
                if let Some(node) = nodes.get_mut(pod.node_name()) {
                    node.add_pod(pod.clone());
                    stats.update_history(node);
                }
            }
            tracked.insert(key, pod);
        }
        WatchEventType::Modified => {
            let old_node = tracked
                .get(&key)
                .map(|p| p.node_name().to_string())
                .unwrap_or_default();
            let new_node = pod.node_name().to_string();

            if pod.phase() == PodPhase::Pending && !stats.is_pending(&pod) {
                stats.push_pending(&pod);
            }

            if old_node != new_node {
                if old_node.is_empty() {
                    // Pending pod got bound: leave the queue, start counting
                    // on the node.
                    debug!(pod = %pod.name(), node = %new_node, "pod bound to node");
                    stats.pending_to_running(&pod);
                    if let Some(node) = nodes.get_mut(&new_node) {
                        node.add_pod(pod.clone());
                        stats.update_history(node);
                    }
                } else if new_node.is_empty() {
                    warn!(pod = %pod.name(), old_node = %old_node, "pod lost its node assignment");
                    if let Some(node) = nodes.get_mut(&old_node) {
                        node.remove_pod(&pod);
                        stats.update_history(node);
                    }
                } else {
                    debug!(pod = %pod.name(), from = %old_node, to = %new_node, "pod reassigned");
                    if let Some(node) = nodes.get_mut(&old_node) {
                        node.remove_pod(&pod);
                        stats.update_history(node);
                    }
                    if let Some(node) = nodes.get_mut(&new_node) {
                        node.add_pod(pod.clone());
                        stats.update_history(node);
                    }
                }
            } else if !new_node.is_empty() {
                // Same node, spec or status changed: refresh and recompute.
                if let Some(node) = nodes.get_mut(&new_node) {
                    node.add_pod(pod.clone());
                    stats.update_history(node);
                }
            }

            tracked.insert(key, pod);
        }
        WatchEventType::Deleted => {
            if pod.phase() == PodPhase::Running {
                debug!(pod = %pod.name(), "running pod deleted");
                stats.record_running_duration(&pod);
            } else {
                debug!(pod = %pod.name(), phase = pod.phase().as_str(), "pod deleted");
            }
            stats.drop_pending(&pod);
            if !pod.node_name().is_empty() {
                if let Some(node) = nodes.get_mut(pod.node_name()) {
                    node.remove_pod(&pod);
                    stats.update_history(node);
                }
            }
            tracked.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::{Duration, Instant};

    use crate::api::{
        Container, NodeStatus, ObjectMeta, PodSpec, Quantity, ResourceRequirements, RESOURCE_CPU,
        RESOURCE_MEMORY,
    };
    use crate::cluster::{FakeCluster, FakeClusterOptions};

    fn test_node(name: &str, cpu: &str, memory: &str) -> Node {
        let capacity: BTreeMap<String, Quantity> = [
            (RESOURCE_CPU.to_string(), Quantity::parse(cpu).unwrap()),
            (RESOURCE_MEMORY.to_string(), Quantity::parse(memory).unwrap()),
        ]
        .into_iter()
        .collect();
        Node {
            metadata: ObjectMeta {
                name: name.to_string(),
                ..Default::default()
            },
            status: NodeStatus {
                capacity: capacity.clone(),
                allocatable: capacity,
            },
        }
    }

    fn test_pod(name: &str, cpu: &str, memory: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: "default".to_string(),
                ..Default::default()
            },
            spec: PodSpec {
                node_name: String::new(),
                containers: vec![Container {
                    name: "main".to_string(),
                    resources: ResourceRequirements {
                        requests: [
                            (RESOURCE_CPU.to_string(), Quantity::parse(cpu).unwrap()),
                            (RESOURCE_MEMORY.to_string(), Quantity::parse(memory).unwrap()),
                        ]
                        .into_iter()
                        .collect(),
                        ..Default::default()
                    },
                    ..Default::default()
                }],
            },
            status: Default::default(),
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !check() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn observer_tracks_node_allocation_through_pod_lifecycle() {
        let cluster = FakeCluster::new(FakeClusterOptions {
            scheduling_delay: Duration::from_millis(20),
        });
        let observer = Observer::new(cluster.clone());
        let (err_tx, _err_rx) = mpsc::unbounded_channel();
        observer.start(err_tx);

        cluster.create_node(test_node("n1", "2", "4Gi")).await.unwrap();
        cluster
            .create_pod(test_pod("pod-1", "1", "1Gi"))
            .await
            .unwrap();

        // Pod goes Pending first, then binds; allocation follows.
        wait_until(|| {
            observer
                .snapshot()
                .nodes
                .get("n1")
                .map(|n| n.allocated[RESOURCE_CPU].milli_value() == 1_000)
                .unwrap_or(false)
        })
        .await;

        let view = observer.snapshot();
        let stats = &view.stats;
        assert!(stats.pending_q.is_empty());
        assert_eq!(stats.pending_durations.len(), 1);
        assert!(stats
            .pending_q_history
            .iter()
            .any(|record| record.value == 1));

        cluster.delete_pod("default", "pod-1").await.unwrap();
        wait_until(|| observer.snapshot().stats.running_durations.len() == 1).await;

        let view = observer.snapshot();
        let node = &view.nodes["n1"];
        assert!(node.allocated[RESOURCE_CPU].is_zero());
        assert!(node.allocated[RESOURCE_MEMORY].is_zero());

        observer.stop();
    }

    #[tokio::test]
    async fn pod_deleted_while_pending_records_no_running_duration() {
        let cluster = FakeCluster::new(FakeClusterOptions {
            scheduling_delay: Duration::from_millis(20),
        });
        let observer = Observer::new(cluster.clone());
        let (err_tx, _err_rx) = mpsc::unbounded_channel();
        observer.start(err_tx);

        // No node fits this pod, so it stays Pending.
        cluster.create_node(test_node("n1", "1", "1Gi")).await.unwrap();
        cluster
            .create_pod(test_pod("big", "8", "32Gi"))
            .await
            .unwrap();

        wait_until(|| observer.snapshot().stats.pending_q.len() == 1).await;

        cluster.delete_pod("default", "big").await.unwrap();
        wait_until(|| observer.snapshot().stats.pending_q.is_empty()).await;

        let stats = observer.stats_snapshot();
        assert!(stats.running_durations.is_empty());
        assert!(stats.pending_durations.is_empty());

        observer.stop();
    }

    #[tokio::test]
    async fn stop_records_a_final_sample_per_node() {
        let cluster = FakeCluster::new(FakeClusterOptions::default());
        let observer = Observer::new(cluster.clone());
        let (err_tx, _err_rx) = mpsc::unbounded_channel();
        observer.start(err_tx);

        cluster.create_node(test_node("n1", "2", "4Gi")).await.unwrap();
        wait_until(|| !observer.snapshot().nodes.is_empty()).await;

        let before = observer.stats_snapshot();
        let node_key = observer.snapshot().nodes["n1"].node.key();
        let samples_before = before.allocation_history[&node_key].len();

        observer.stop();
        let after = observer.stats_snapshot();
        assert_eq!(
            after.allocation_history[&node_key].len(),
            samples_before + 1
        );
    }

    #[tokio::test]
    async fn removed_nodes_leave_the_cache() {
        let cluster = FakeCluster::new(FakeClusterOptions::default());
        let observer = Observer::new(cluster.clone());
        let (err_tx, _err_rx) = mpsc::unbounded_channel();
        observer.start(err_tx);

        cluster.create_node(test_node("n1", "2", "4Gi")).await.unwrap();
        wait_until(|| observer.snapshot().nodes.contains_key("n1")).await;

        cluster.delete_node("n1").await.unwrap();
        wait_until(|| !observer.snapshot().nodes.contains_key("n1")).await;

        observer.stop();
    }

    #[tokio::test]
    async fn pod_event_trail_records_adds_and_deletes() {
        let cluster = FakeCluster::new(FakeClusterOptions::default());
        let observer = Observer::new(cluster.clone());
        let (err_tx, _err_rx) = mpsc::unbounded_channel();
        observer.start(err_tx);

        cluster
            .create_pod(test_pod("pod-1", "100m", "64Mi"))
            .await
            .unwrap();
        wait_until(|| !observer.stats_snapshot().pod_event_history.is_empty()).await;
        cluster.delete_pod("default", "pod-1").await.unwrap();

        wait_until(|| {
            observer
                .stats_snapshot()
                .pod_event_history
                .iter()
                .any(|r| r.value.event_type == "Deleted")
        })
        .await;

        let stats = observer.stats_snapshot();
        assert!(stats
            .pod_event_history
            .iter()
            .any(|r| r.value.event_type == "Added" && r.value.pod_name == "pod-1"));

        observer.stop();
    }
}
