//! Per-node occupancy derived from observed pods.

use std::collections::{BTreeMap, HashMap};

use crate::api::{Node, ObjectKey, Pod, Quantity, ResourceList, RESOURCE_CPU, RESOURCE_MEMORY};

/// What the observer knows about one node: the latest descriptor plus the
/// pods currently assigned to it and the resource sums derived from them.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub node: Node,
    pub capacity: ResourceList,
    pub allocatable: ResourceList,
    pub running_pods: HashMap<ObjectKey, Pod>,
    /// Sum of first-container requests over `running_pods`.
    pub allocated: ResourceList,
    /// `allocated / allocatable` per resource, over milli-values. Resources
    /// with zero or absent allocatable are left out.
    pub allocated_ratio: BTreeMap<String, f64>,
}

impl NodeState {
    pub fn new(node: Node) -> Self {
        let mut state = Self {
            capacity: node.status.capacity.clone(),
            allocatable: node.status.allocatable.clone(),
            node,
            running_pods: HashMap::new(),
            allocated: ResourceList::new(),
            allocated_ratio: BTreeMap::new(),
        };
        state.recompute();
        state
    }

    /// Replaces the node descriptor, e.g. after a node Modified event.
    pub fn update_node(&mut self, node: Node) {
        self.capacity = node.status.capacity.clone();
        self.allocatable = node.status.allocatable.clone();
        self.node = node;
        self.recompute();
    }

    pub fn add_pod(&mut self, pod: Pod) {
        self.running_pods.insert(pod.key(), pod);
        self.recompute();
    }

    pub fn remove_pod(&mut self, pod: &Pod) {
        self.running_pods.remove(&pod.key());
        self.recompute();
    }

    /// Re-derives `allocated` and `allocated_ratio` from `running_pods`.
    ///
    /// An empty node gets explicit zero entries for cpu and memory so the
    /// sampled histories show emptiness instead of missing columns.
    pub fn recompute(&mut self) {
        let mut millis: BTreeMap<String, i64> = BTreeMap::new();
        for pod in self.running_pods.values() {
            for (resource, quantity) in pod.first_container_requests() {
                *millis.entry(resource).or_insert(0) += quantity.milli_value();
            }
        }

        if millis.is_empty() {
            self.allocated = [
                (RESOURCE_CPU.to_string(), Quantity::zero()),
                (RESOURCE_MEMORY.to_string(), Quantity::zero()),
            ]
            .into_iter()
            .collect();
            self.allocated_ratio = [
                (RESOURCE_CPU.to_string(), 0.0),
                (RESOURCE_MEMORY.to_string(), 0.0),
            ]
            .into_iter()
            .collect();
            return;
        }

        self.allocated = millis
            .iter()
            .map(|(resource, &m)| (resource.clone(), Quantity::from_millis(m)))
            .collect();

        self.allocated_ratio = millis
            .iter()
            .filter_map(|(resource, &m)| {
                let allocatable = self.allocatable.get(resource)?.milli_value();
                (allocatable != 0).then(|| (resource.clone(), m as f64 / allocatable as f64))
            })
            .collect();
    }

    /// `allocatable - allocated` per resource, derived on demand.
    pub fn free(&self) -> ResourceList {
        self.allocatable
            .iter()
            .map(|(resource, allocatable)| {
                let used = self
                    .allocated
                    .get(resource)
                    .map(|q| q.milli_value())
                    .unwrap_or(0);
                (
                    resource.clone(),
                    Quantity::from_millis(allocatable.milli_value() - used),
                )
            })
            .collect()
    }
}
