//! Time-indexed statistics collected while a simulation runs.
//!
//! Everything here is append-only; consumers get deep copies via the
//! observer's snapshot so exported histories cannot be mutated after the
//! fact.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::api::{ObjectKey, Pod, ResourceList, RESOURCE_CPU, RESOURCE_MEMORY};
use crate::cluster::WatchEventType;
use crate::observer::NodeState;

/// A sampled value with the wall-clock instant it was taken.
#[derive(Debug, Clone)]
pub struct Record<T> {
    pub at: DateTime<Utc>,
    pub value: T,
}

impl<T> Record<T> {
    pub fn now(value: T) -> Self {
        Self {
            at: Utc::now(),
            value,
        }
    }
}

/// One row of the raw pod-event trail.
#[derive(Debug, Clone)]
pub struct PodEventRecord {
    pub pod_name: String,
    pub node_name: String,
    pub phase: &'static str,
    pub event_type: &'static str,
    pub cpu_req: String,
    pub mem_req: String,
}

impl PodEventRecord {
    pub fn new(pod: &Pod, event_type: WatchEventType) -> Self {
        Self {
            pod_name: pod.name().to_string(),
            node_name: pod.node_name().to_string(),
            phase: pod.phase().as_str(),
            event_type: event_type.as_str(),
            cpu_req: pod.request(RESOURCE_CPU).to_string(),
            mem_req: pod.request(RESOURCE_MEMORY).to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Stats {
    /// Pods currently observed in the Pending phase.
    pub pending_q: HashMap<ObjectKey, Pod>,
    /// Length of the pending queue after every change.
    pub pending_q_history: Vec<Record<usize>>,
    /// Time from creation to the first Running observation, per pod.
    pub pending_durations: HashMap<ObjectKey, Duration>,
    /// Time from creation to deletion-while-running, per pod.
    pub running_durations: HashMap<ObjectKey, Duration>,
    pub allocation_history: HashMap<ObjectKey, Vec<Record<ResourceList>>>,
    pub allocation_ratio_history: HashMap<ObjectKey, Vec<Record<BTreeMap<String, f64>>>>,
    pub free_history: HashMap<ObjectKey, Vec<Record<ResourceList>>>,
    pub pod_event_history: Vec<Record<PodEventRecord>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pod_event(&mut self, pod: &Pod, event_type: WatchEventType) {
        self.pod_event_history
            .push(Record::now(PodEventRecord::new(pod, event_type)));
    }

    /// Adds a pod to the pending queue and samples the new length.
    pub fn push_pending(&mut self, pod: &Pod) {
        self.pending_q.insert(pod.key(), pod.clone());
        self.sample_queue_len();
    }

    pub fn is_pending(&self, pod: &Pod) -> bool {
        self.pending_q.contains_key(&pod.key())
    }

    /// Removes a pod that left Pending by starting to run, recording its
    /// pending duration as now minus its creation timestamp.
    pub fn pending_to_running(&mut self, pod: &Pod) {
        let key = pod.key();
        if self.pending_q.remove(&key).is_some() {
            self.pending_durations.insert(key, age_of(pod));
            self.sample_queue_len();
        }
    }

    /// Removes a pod deleted while still Pending. No duration is recorded;
    /// the pod never ran.
    pub fn drop_pending(&mut self, pod: &Pod) {
        if self.pending_q.remove(&pod.key()).is_some() {
            self.sample_queue_len();
        }
    }

    /// Records the running duration of a pod deleted while Running.
    pub fn record_running_duration(&mut self, pod: &Pod) {
        self.running_durations.insert(pod.key(), age_of(pod));
    }

    /// Samples allocation, ratio, and free histories for one node.
    pub fn update_history(&mut self, node: &NodeState) {
        let key = node.node.key();
        self.allocation_history
            .entry(key.clone())
            .or_default()
            .push(Record::now(node.allocated.clone()));
        self.allocation_ratio_history
            .entry(key.clone())
            .or_default()
            .push(Record::now(node.allocated_ratio.clone()));
        self.free_history
            .entry(key)
            .or_default()
            .push(Record::now(node.free()));
    }

    fn sample_queue_len(&mut self) {
        self.pending_q_history
            .push(Record::now(self.pending_q.len()));
    }
}

fn age_of(pod: &Pod) -> Duration {
    pod.metadata
        .creation_timestamp
        .and_then(|created| (Utc::now() - created).to_std().ok())
        .unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Container, ObjectMeta, PodSpec, Quantity, ResourceRequirements};

    fn pending_pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: name.into(),
                uid: format!("{name}-uid"),
                creation_timestamp: Some(Utc::now() - chrono::Duration::milliseconds(50)),
                ..Default::default()
            },
            spec: PodSpec {
                containers: vec![Container {
                    name: "main".into(),
                    resources: ResourceRequirements {
                        requests: [
                            (RESOURCE_CPU.to_string(), Quantity::parse("100m").unwrap()),
                            (RESOURCE_MEMORY.to_string(), Quantity::parse("64Mi").unwrap()),
                        ]
                        .into_iter()
                        .collect(),
                        ..Default::default()
                    },
                    ..Default::default()
                }],
                ..Default::default()
            },
            status: Default::default(),
        }
    }

    #[test]
    fn queue_length_history_tracks_every_change() {
        let mut stats = Stats::new();
        let a = pending_pod("a");
        let b = pending_pod("b");

        stats.push_pending(&a);
        stats.push_pending(&b);
        stats.pending_to_running(&a);

        let lengths: Vec<usize> = stats.pending_q_history.iter().map(|r| r.value).collect();
        assert_eq!(lengths, [1, 2, 1]);
    }

    #[test]
    fn pending_duration_is_measured_from_creation() {
        let mut stats = Stats::new();
        let pod = pending_pod("a");
        stats.push_pending(&pod);
        stats.pending_to_running(&pod);

        let duration = stats.pending_durations[&pod.key()];
        assert!(duration >= Duration::from_millis(50));
        assert!(duration < Duration::from_secs(5));
    }

    #[test]
    fn dropping_a_pending_pod_records_no_duration() {
        let mut stats = Stats::new();
        let pod = pending_pod("a");
        stats.push_pending(&pod);
        stats.drop_pending(&pod);

        assert!(stats.pending_durations.is_empty());
        assert!(stats.pending_q.is_empty());
    }

    #[test]
    fn pending_to_running_for_unknown_pod_is_a_no_op() {
        let mut stats = Stats::new();
        let pod = pending_pod("a");
        stats.pending_to_running(&pod);

        assert!(stats.pending_durations.is_empty());
        assert!(stats.pending_q_history.is_empty());
    }

    #[test]
    fn pod_event_records_capture_requests() {
        let mut stats = Stats::new();
        let pod = pending_pod("a");
        stats.record_pod_event(&pod, WatchEventType::Added);

        let record = &stats.pod_event_history[0].value;
        assert_eq!(record.pod_name, "a");
        assert_eq!(record.event_type, "Added");
        assert_eq!(record.phase, "Pending");
        assert_eq!(record.cpu_req, "100m");
        assert_eq!(record.mem_req, "64Mi");
    }
}
