//! Object model for the slice of the Kubernetes API the replay engine
//! touches: pods, nodes, and their resource accounting.
//!
//! These are deliberately not the full upstream types. Scenario files carry
//! plain pod/node descriptors and the engine only reads the fields below;
//! unknown manifest fields are ignored on input so real-world specs can be
//! pasted into scenarios unchanged.

mod quantity;

pub use quantity::{Quantity, QuantityError};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const RESOURCE_CPU: &str = "cpu";
pub const RESOURCE_MEMORY: &str = "memory";
pub const RESOURCE_PODS: &str = "pods";

/// Named resource amounts, keyed by resource name (`cpu`, `memory`, ...).
pub type ResourceList = BTreeMap<String, Quantity>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

/// Stable identity of an observed object: (UID, name).
///
/// Names alone are not stable across a delete/recreate of the same pod, so
/// every node-cache and stats map is keyed by this pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub uid: String,
    pub name: String,
}

impl ObjectKey {
    pub fn of(meta: &ObjectMeta) -> Self {
        Self {
            uid: meta.uid.clone(),
            name: meta.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: ResourceList,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: ResourceList,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default)]
    pub resources: ResourceRequirements,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,
    #[serde(default)]
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

impl Pod {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::of(&self.metadata)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn node_name(&self) -> &str {
        &self.spec.node_name
    }

    pub fn phase(&self) -> PodPhase {
        self.status.phase
    }

    /// Requests of the first container, the unit of accounting everywhere.
    pub fn first_container_requests(&self) -> ResourceList {
        self.spec
            .containers
            .first()
            .map(|c| c.resources.requests.clone())
            .unwrap_or_default()
    }

    pub fn request(&self, resource: &str) -> Quantity {
        self.spec
            .containers
            .first()
            .and_then(|c| c.resources.requests.get(resource).cloned())
            .unwrap_or_else(Quantity::zero)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capacity: ResourceList,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub allocatable: ResourceList,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: NodeStatus,
}

impl Node {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::of(&self.metadata)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_manifest_parses() {
        let yaml = r#"
metadata:
  name: pod-1
  namespace: default
spec:
  containers:
    - name: nginx
      image: nginx
      resources:
        requests:
          cpu: 500m
          memory: 128Mi
"#;
        let pod: Pod = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(pod.name(), "pod-1");
        assert_eq!(pod.phase(), PodPhase::Pending);
        assert_eq!(pod.request(RESOURCE_CPU).milli_value(), 500);
        assert_eq!(
            pod.request(RESOURCE_MEMORY).milli_value(),
            128 * 1024 * 1024 * 1_000
        );
    }

    #[test]
    fn node_manifest_parses() {
        let yaml = r#"
metadata:
  name: node-1
  labels:
    zone: a
status:
  capacity:
    cpu: 2
    memory: 4Gi
    pods: 110
  allocatable:
    cpu: 2
    memory: 4Gi
    pods: 110
"#;
        let node: Node = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(node.name(), "node-1");
        assert_eq!(node.status.capacity[RESOURCE_CPU].value(), 2);
        assert_eq!(node.status.allocatable[RESOURCE_PODS].value(), 110);
    }

    #[test]
    fn missing_requests_default_to_zero() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: "p".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(pod.request(RESOURCE_CPU).is_zero());
        assert!(pod.first_container_requests().is_empty());
    }
}
