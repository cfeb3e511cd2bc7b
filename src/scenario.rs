//! Scenario files: a cluster topology plus a timeline of pod and
//! scheduler-weight events.
//!
//! Scenarios are YAML (or JSON, which the YAML parser accepts) with
//! Go-style duration strings ("10s", "1m30s") for arrival and eviction
//! offsets.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::{info, warn};

use crate::api::{Node, Pod, RESOURCE_CPU, RESOURCE_MEMORY};

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("scenario parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("pod event {0:?}: pod spec has no containers")]
    NoContainers(String),

    #[error("pod event {event:?}: first container has no {resource} request")]
    MissingRequest { event: String, resource: &'static str },

    #[error("duplicate pod event name {0:?}")]
    DuplicatePodEvent(String),

    #[error("scheduler event {0:?} has no weights")]
    EmptyWeights(String),

    #[error("scheduler event {event:?}: weight {weight} for plugin {plugin:?} must be at least 1")]
    InvalidWeight {
        event: String,
        plugin: String,
        weight: i32,
    },
}

/// Duration with Go-style string serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct EventDuration(pub Duration);

impl EventDuration {
    pub fn duration(&self) -> Duration {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<Duration> for EventDuration {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}

impl fmt::Display for EventDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", humantime::format_duration(self.0))
    }
}

impl Serialize for EventDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EventDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw)
            .map(Self)
            .map_err(|e| de::Error::custom(format!("invalid duration {raw:?}: {e}")))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    #[serde(default)]
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodEventSpec {
    pub name: String,
    pub arrival_time: EventDuration,
    /// Delay from Running to eviction; "0s" means never evicted by us.
    #[serde(default)]
    pub evict_time: EventDuration,
    pub pod_spec: Pod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_timeout: Option<EventDuration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerEventSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub arrival_time: EventDuration,
    pub weights: BTreeMap<String, i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventsSpec {
    #[serde(default)]
    pub pods: Vec<PodEventSpec>,
    #[serde(default)]
    pub scheduler: Vec<SchedulerEventSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub metadata: Metadata,
    #[serde(default)]
    pub cluster: ClusterSpec,
    #[serde(default)]
    pub events: EventsSpec,
}

impl Scenario {
    pub fn from_yaml(contents: &str) -> Result<Self, ScenarioError> {
        let scenario: Scenario = serde_yaml::from_str(contents)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read scenario file {}", path.display()))?;
        Self::from_yaml(&contents)
            .with_context(|| format!("failed to load scenario {}", path.display()))
    }

    pub fn to_yaml(&self) -> Result<String, ScenarioError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), ScenarioError> {
        let mut seen = std::collections::HashSet::new();
        for event in &self.events.pods {
            if !seen.insert(event.name.as_str()) {
                return Err(ScenarioError::DuplicatePodEvent(event.name.clone()));
            }

            let Some(container) = event.pod_spec.spec.containers.first() else {
                return Err(ScenarioError::NoContainers(event.name.clone()));
            };
            for resource in [RESOURCE_CPU, RESOURCE_MEMORY] {
                if !container.resources.requests.contains_key(resource) {
                    return Err(ScenarioError::MissingRequest {
                        event: event.name.clone(),
                        resource,
                    });
                }
            }

            if event.evict_time.is_zero() {
                warn!(
                    event = %event.name,
                    "evict time is zero; the run will not wait for this pod"
                );
            }
        }

        for event in &self.events.scheduler {
            if event.weights.is_empty() {
                return Err(ScenarioError::EmptyWeights(event.name.clone()));
            }
            for (plugin, &weight) in &event.weights {
                if weight < 1 {
                    return Err(ScenarioError::InvalidWeight {
                        event: event.name.clone(),
                        plugin: plugin.clone(),
                        weight,
                    });
                }
            }
        }

        Ok(())
    }

    /// Logs a short summary of the scenario, the way operators expect to
    /// see before a run starts.
    pub fn describe(&self) {
        info!(
            scenario = %self.metadata.name,
            nodes = self.cluster.nodes.len(),
            pod_events = self.events.pods.len(),
            scheduler_events = self.events.scheduler.len(),
            "scenario loaded"
        );
        for node in &self.cluster.nodes {
            let cpu = node.status.capacity.get(RESOURCE_CPU);
            let memory = node.status.capacity.get(RESOURCE_MEMORY);
            info!(
                node = %node.name(),
                cpu = cpu.map(|q| q.to_string()).unwrap_or_default(),
                memory = memory.map(|q| q.to_string()).unwrap_or_default(),
                "cluster node"
            );
        }
        if let Some(longest) = self.events.pods.iter().max_by_key(|e| e.arrival_time) {
            info!(
                event = %longest.name,
                arrival = %longest.arrival_time,
                "last pod arrival"
            );
        }
    }

    /// Names of pods whose deletion gates run completion.
    pub fn completion_pod_names(&self) -> Vec<String> {
        self.events
            .pods
            .iter()
            .filter(|event| !event.evict_time.is_zero())
            .map(|event| event.pod_spec.metadata.name.clone())
            .collect()
    }
}
