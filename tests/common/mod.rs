//! Shared helpers for integration tests.

use std::time::Duration;

use kube_replay::observer::Stats;

/// Renders a scenario with one node and a list of pod events, all on one
/// container shape, the way operators actually write them.
pub fn scenario_yaml(
    name: &str,
    node_cpu: &str,
    node_memory: &str,
    pods: &[(&str, &str, &str, &str, &str)], // (name, arrival, evict, cpu, memory)
) -> String {
    let mut yaml = format!(
        r#"metadata:
  name: {name}
cluster:
  nodes:
    - metadata:
        name: n1
      status:
        capacity:
          cpu: {node_cpu}
          memory: {node_memory}
          pods: 110
        allocatable:
          cpu: {node_cpu}
          memory: {node_memory}
          pods: 110
events:
  pods:
"#
    );
    for (pod, arrival, evict, cpu, memory) in pods {
        yaml.push_str(&format!(
            r#"    - name: {pod}
      arrivalTime: {arrival}
      evictTime: {evict}
      podSpec:
        metadata:
          name: {pod}
          namespace: default
        spec:
          containers:
            - name: nginx
              image: nginx
              resources:
                requests:
                  cpu: {cpu}
                  memory: {memory}
"#
        ));
    }
    yaml
}

/// Looks up a per-pod duration by pod name.
pub fn duration_by_name(
    durations: &std::collections::HashMap<kube_replay::api::ObjectKey, Duration>,
    name: &str,
) -> Option<Duration> {
    durations
        .iter()
        .find(|(key, _)| key.name == name)
        .map(|(_, d)| *d)
}

/// Highest sampled cpu allocation (milli) for a node across the run.
pub fn peak_cpu_allocation(stats: &Stats, node: &str) -> i64 {
    stats
        .allocation_history
        .iter()
        .filter(|(key, _)| key.name == node)
        .flat_map(|(_, records)| records.iter())
        .filter_map(|record| record.value.get(kube_replay::api::RESOURCE_CPU))
        .map(|q| q.milli_value())
        .max()
        .unwrap_or(0)
}
