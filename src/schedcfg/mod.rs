//! kube-scheduler configuration handling for reweight events.
//!
//! The scheduler exposes its `KubeSchedulerConfiguration` over a plain HTTP
//! endpoint (GET current, POST replacement). Reweight events fetch the
//! config, rewrite plugin weights inside the first profile's MultiPoint
//! enabled list, and post it back. [`SchedulerConfigApi`] abstracts the
//! endpoint so tests can swap in [`InMemorySchedulerConfig`].

mod http;

pub use http::HttpSchedulerConfig;

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Plugins present in the default kube-scheduler MultiPoint set.
pub const KNOWN_PLUGINS: &[&str] = &[
    "SchedulingGates",
    "PrioritySort",
    "NodeUnschedulable",
    "NodeName",
    "TaintToleration",
    "NodeAffinity",
    "NodePorts",
    "NodeResourcesFit",
    "VolumeRestrictions",
    "EBSLimits",
    "GCEPDLimits",
    "NodeVolumeLimits",
    "AzureDiskLimits",
    "VolumeBinding",
    "VolumeZone",
    "PodTopologySpread",
    "InterPodAffinity",
    "DefaultPreemption",
    "NodeResourcesBalancedAllocation",
    "ImageLocality",
    "DefaultBinder",
];

pub fn is_known_plugin(name: &str) -> bool {
    KNOWN_PLUGINS.contains(&name)
}

/// Upstream default scoring weights, used only by the reset path.
pub fn default_plugin_weights() -> BTreeMap<String, i32> {
    KNOWN_PLUGINS
        .iter()
        .map(|&name| {
            let weight = match name {
                "TaintToleration" => 3,
                "NodeAffinity" | "PodTopologySpread" | "InterPodAffinity" => 2,
                _ => 1,
            };
            (name.to_string(), weight)
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum SchedulerConfigError {
    #[error("scheduler config request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("scheduler config endpoint returned status {status}")]
    UnexpectedStatus { status: u16 },

    #[error("weight {weight} for plugin {plugin:?} must be at least 1")]
    InvalidWeight { plugin: String, weight: i32 },

    #[error("plugin {0:?} is not enabled in the first profile")]
    PluginNotEnabled(String),

    #[error("scheduler configuration has no profiles")]
    NoProfiles,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfiguration {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default)]
    pub profiles: Vec<Profile>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scheduler_name: String,
    #[serde(default)]
    pub plugins: Plugins,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plugins {
    #[serde(default)]
    pub multi_point: PluginSet,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginSet {
    #[serde(default)]
    pub enabled: Vec<PluginRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled: Vec<PluginRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
}

impl SchedulerConfiguration {
    /// A configuration with every known plugin enabled at its default
    /// weight, shaped like the one a stock scheduler serves.
    pub fn with_defaults() -> Self {
        let defaults = default_plugin_weights();
        let enabled = KNOWN_PLUGINS
            .iter()
            .map(|&name| PluginRef {
                name: name.to_string(),
                weight: defaults.get(name).copied(),
            })
            .collect();

        Self {
            api_version: "kubescheduler.config.k8s.io/v1".to_string(),
            kind: "KubeSchedulerConfiguration".to_string(),
            profiles: vec![Profile {
                scheduler_name: "default-scheduler".to_string(),
                plugins: Plugins {
                    multi_point: PluginSet {
                        enabled,
                        disabled: Vec::new(),
                    },
                },
            }],
        }
    }

    /// Flattened `plugin -> weight` view of the first profile's MultiPoint
    /// enabled list. A plugin without an explicit weight counts as 1.
    pub fn plugin_weights(&self) -> BTreeMap<String, i32> {
        self.profiles
            .first()
            .map(|profile| {
                profile
                    .plugins
                    .multi_point
                    .enabled
                    .iter()
                    .map(|p| (p.name.clone(), p.weight.unwrap_or(1)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Rewrites the given plugin weights in the first profile.
    ///
    /// Validates every entry before touching the config so a bad entry
    /// never leaves a partial update behind. Weights below 1 and plugins
    /// missing from the enabled list are errors; names outside the known
    /// set only warn, since clusters may carry out-of-tree plugins.
    pub fn apply_weights(
        &mut self,
        weights: &BTreeMap<String, i32>,
    ) -> Result<(), SchedulerConfigError> {
        let profile = self
            .profiles
            .first_mut()
            .ok_or(SchedulerConfigError::NoProfiles)?;
        let enabled = &mut profile.plugins.multi_point.enabled;

        let mut updates: Vec<(usize, i32)> = Vec::with_capacity(weights.len());
        for (name, &weight) in weights {
            if weight < 1 {
                return Err(SchedulerConfigError::InvalidWeight {
                    plugin: name.clone(),
                    weight,
                });
            }
            if !is_known_plugin(name) {
                warn!(plugin = %name, "weight change for plugin outside the known set");
            }
            let index = enabled
                .iter()
                .position(|p| &p.name == name)
                .ok_or_else(|| SchedulerConfigError::PluginNotEnabled(name.clone()))?;
            updates.push((index, weight));
        }

        for (index, weight) in updates {
            enabled[index].weight = Some(weight);
        }
        Ok(())
    }
}

/// The scheduler-configuration endpoint as the engine sees it.
#[async_trait]
pub trait SchedulerConfigApi: Send + Sync {
    async fn get(&self) -> Result<SchedulerConfiguration, SchedulerConfigError>;

    async fn put(&self, config: &SchedulerConfiguration) -> Result<(), SchedulerConfigError>;

    /// Read-modify-write of plugin weights.
    async fn update_weights(
        &self,
        weights: &BTreeMap<String, i32>,
    ) -> Result<(), SchedulerConfigError> {
        let mut config = self.get().await?;
        config.apply_weights(weights)?;
        self.put(&config).await
    }

    /// Restore the upstream default weight table.
    async fn reset_to_defaults(&self) -> Result<(), SchedulerConfigError> {
        self.update_weights(&default_plugin_weights()).await
    }
}

/// Config store without the HTTP hop, for tests and sandboxed runs.
#[derive(Debug)]
pub struct InMemorySchedulerConfig {
    config: Mutex<SchedulerConfiguration>,
}

impl InMemorySchedulerConfig {
    pub fn new(config: SchedulerConfiguration) -> Self {
        Self {
            config: Mutex::new(config),
        }
    }
}

impl Default for InMemorySchedulerConfig {
    fn default() -> Self {
        Self::new(SchedulerConfiguration::with_defaults())
    }
}

#[async_trait]
impl SchedulerConfigApi for InMemorySchedulerConfig {
    async fn get(&self) -> Result<SchedulerConfiguration, SchedulerConfigError> {
        Ok(self.config.lock().expect("config lock poisoned").clone())
    }

    async fn put(&self, config: &SchedulerConfiguration) -> Result<(), SchedulerConfigError> {
        *self.config.lock().expect("config lock poisoned") = config.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_carries_default_weights() {
        let config = SchedulerConfiguration::with_defaults();
        let weights = config.plugin_weights();
        assert_eq!(weights["TaintToleration"], 3);
        assert_eq!(weights["NodeAffinity"], 2);
        assert_eq!(weights["PodTopologySpread"], 2);
        assert_eq!(weights["InterPodAffinity"], 2);
        assert_eq!(weights["NodeResourcesFit"], 1);
        assert_eq!(weights.len(), KNOWN_PLUGINS.len());
    }

    #[test]
    fn apply_weights_updates_only_named_plugins() {
        let mut config = SchedulerConfiguration::with_defaults();
        let before = config.plugin_weights();

        let mut weights = BTreeMap::new();
        weights.insert("NodeResourcesFit".to_string(), 5);
        config.apply_weights(&weights).unwrap();

        let after = config.plugin_weights();
        assert_eq!(after["NodeResourcesFit"], 5);
        for (name, weight) in &before {
            if name != "NodeResourcesFit" {
                assert_eq!(after[name], *weight, "plugin {name} should be untouched");
            }
        }
    }

    #[test]
    fn apply_weights_is_idempotent() {
        let mut config = SchedulerConfiguration::with_defaults();
        let mut weights = BTreeMap::new();
        weights.insert("ImageLocality".to_string(), 7);

        config.apply_weights(&weights).unwrap();
        let once = config.clone();
        config.apply_weights(&weights).unwrap();
        assert_eq!(once, config);
    }

    #[test]
    fn weight_below_one_is_rejected_without_partial_update() {
        let mut config = SchedulerConfiguration::with_defaults();
        let before = config.clone();

        let mut weights = BTreeMap::new();
        weights.insert("ImageLocality".to_string(), 4);
        weights.insert("NodeAffinity".to_string(), 0);

        let err = config.apply_weights(&weights).unwrap_err();
        assert!(matches!(err, SchedulerConfigError::InvalidWeight { .. }));
        assert_eq!(before, config);
    }

    #[test]
    fn absent_plugin_is_rejected_without_partial_update() {
        let mut config = SchedulerConfiguration::with_defaults();
        config.profiles[0]
            .plugins
            .multi_point
            .enabled
            .retain(|p| p.name != "VolumeZone");
        let before = config.clone();

        let mut weights = BTreeMap::new();
        // BTreeMap iteration order puts ImageLocality first; it must still
        // be untouched after the failure on VolumeZone.
        weights.insert("ImageLocality".to_string(), 9);
        weights.insert("VolumeZone".to_string(), 2);

        let err = config.apply_weights(&weights).unwrap_err();
        assert!(matches!(err, SchedulerConfigError::PluginNotEnabled(_)));
        assert_eq!(before, config);
    }

    #[tokio::test]
    async fn in_memory_api_round_trips() {
        let api = InMemorySchedulerConfig::default();
        let mut weights = BTreeMap::new();
        weights.insert("NodeResourcesFit".to_string(), 5);

        api.update_weights(&weights).await.unwrap();
        assert_eq!(api.get().await.unwrap().plugin_weights()["NodeResourcesFit"], 5);

        api.reset_to_defaults().await.unwrap();
        assert_eq!(api.get().await.unwrap().plugin_weights()["NodeResourcesFit"], 1);
    }

    #[test]
    fn config_json_round_trip() {
        let config = SchedulerConfiguration::with_defaults();
        let json = serde_json::to_string(&config).unwrap();
        let back: SchedulerConfiguration = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
