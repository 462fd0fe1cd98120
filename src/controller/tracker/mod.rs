//! Dependency tracking for ConfigMaps and Secrets referenced by a pod spec
//!
//! References are discovered in four places: volumes, projected volume
//! sources, container `env[].valueFrom` and container `envFrom`, for both
//! regular and init containers. Discovery and rewriting walk the same paths
//! through [`visit_config_refs`], so a reference that is tracked is always a
//! reference that gets renamed on the primary.

pub mod config;
pub mod nop;

pub use config::ConfigTracker;
pub use nop::NopTracker;

use super::CanaryError;
use crate::crd::canary::Canary;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::PodSpec;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Kind of a tracked configuration object
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConfigRefType {
    ConfigMap,
    Secret,
}

impl fmt::Display for ConfigRefType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigRefType::ConfigMap => f.write_str("configmap"),
            ConfigRefType::Secret => f.write_str("secret"),
        }
    }
}

/// A tracked ConfigMap or Secret with its content checksum
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigRef {
    pub name: String,
    pub type_: ConfigRefType,
    pub checksum: String,
}

impl ConfigRef {
    /// `{kind}/{name}`, the key used in `status.trackedConfigs`
    pub fn identity(&self) -> String {
        identity(self.type_, &self.name)
    }
}

pub fn identity(type_: ConfigRefType, name: &str) -> String {
    format!("{type_}/{name}")
}

/// Tracked references keyed by identity
pub type ConfigRefs = BTreeMap<String, ConfigRef>;

/// Result of scanning a target for its configuration dependencies
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigScan {
    pub refs: ConfigRefs,
    /// References that could not be fetched and were left out
    pub skipped: usize,
}

impl ConfigScan {
    /// Identity to checksum, as persisted on the Canary status
    pub fn checksums(&self) -> BTreeMap<String, String> {
        self.refs
            .iter()
            .map(|(id, r)| (id.clone(), r.checksum.clone()))
            .collect()
    }
}

/// Tracks the configuration objects a target depends on
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Fetch and fingerprint every ConfigMap/Secret the target references
    ///
    /// References that cannot be fetched are logged and counted in
    /// [`ConfigScan::skipped`]; they never fail the scan.
    async fn get_target_configs(&self, canary: &Canary) -> Result<ConfigScan, CanaryError>;

    /// Identity to checksum of the current target configs
    async fn get_config_refs(
        &self,
        canary: &Canary,
    ) -> Result<BTreeMap<String, String>, CanaryError> {
        Ok(self.get_target_configs(canary).await?.checksums())
    }

    /// Compare a fresh scan with `status.trackedConfigs`
    async fn has_config_changed(&self, canary: &Canary) -> Result<bool, CanaryError>;

    /// Upsert a `{name}-primary` copy of every tracked object
    async fn create_primary_configs(
        &self,
        canary: &Canary,
        refs: &ConfigRefs,
    ) -> Result<(), CanaryError>;

    /// Point every reference in `spec` that is in `refs` at its primary copy
    fn apply_primary_configs(&self, spec: PodSpec, refs: &ConfigRefs)
        -> Result<PodSpec, CanaryError>;
}

/// Whether a fresh set of references differs from the tracked checksums
pub fn configs_changed(refs: &ConfigRefs, tracked: Option<&BTreeMap<String, String>>) -> bool {
    let tracked_empty = tracked.map_or(true, BTreeMap::is_empty);
    if refs.is_empty() && tracked_empty {
        return false;
    }
    let Some(tracked) = tracked.filter(|t| !t.is_empty()) else {
        return true;
    };
    if refs.len() != tracked.len() {
        return true;
    }
    refs.iter()
        .any(|(id, r)| tracked.get(id) != Some(&r.checksum))
}

fn items<'a>(value: &'a mut Value, key: &str) -> impl Iterator<Item = &'a mut Value> {
    value
        .get_mut(key)
        .and_then(Value::as_array_mut)
        .into_iter()
        .flatten()
}

fn field<'a>(value: &'a mut Value, path: &[&str]) -> Option<&'a mut Value> {
    path.iter()
        .try_fold(value, |current, key| current.get_mut(*key))
        .filter(|v| v.is_string())
}

/// Call `visit` with the name node of every ConfigMap/Secret reference in a
/// JSON-encoded pod spec
pub fn visit_config_refs<F>(spec: &mut Value, mut visit: F)
where
    F: FnMut(ConfigRefType, &mut Value),
{
    for volume in items(spec, "volumes") {
        if let Some(name) = field(volume, &["configMap", "name"]) {
            visit(ConfigRefType::ConfigMap, name);
        }
        if let Some(name) = field(volume, &["secret", "secretName"]) {
            visit(ConfigRefType::Secret, name);
        }
        if let Some(projected) = volume.get_mut("projected") {
            for source in items(projected, "sources") {
                if let Some(name) = field(source, &["configMap", "name"]) {
                    visit(ConfigRefType::ConfigMap, name);
                }
                if let Some(name) = field(source, &["secret", "name"]) {
                    visit(ConfigRefType::Secret, name);
                }
            }
        }
    }

    for list in ["initContainers", "containers"] {
        for container in items(spec, list) {
            for env in items(container, "env") {
                if let Some(name) = field(env, &["valueFrom", "configMapKeyRef", "name"]) {
                    visit(ConfigRefType::ConfigMap, name);
                }
                if let Some(name) = field(env, &["valueFrom", "secretKeyRef", "name"]) {
                    visit(ConfigRefType::Secret, name);
                }
            }
            for env_from in items(container, "envFrom") {
                if let Some(name) = field(env_from, &["configMapRef", "name"]) {
                    visit(ConfigRefType::ConfigMap, name);
                }
                if let Some(name) = field(env_from, &["secretRef", "name"]) {
                    visit(ConfigRefType::Secret, name);
                }
            }
        }
    }
}

/// Distinct (kind, name) pairs referenced by a pod spec
pub fn referenced_configs(spec: &PodSpec) -> Result<Vec<(ConfigRefType, String)>, CanaryError> {
    let mut value =
        serde_json::to_value(spec).map_err(|e| CanaryError::Serialization(e.to_string()))?;
    let mut found = std::collections::BTreeSet::new();
    visit_config_refs(&mut value, |type_, name| {
        if let Some(name) = name.as_str().filter(|n| !n.is_empty()) {
            found.insert((type_, name.to_string()));
        }
    });
    Ok(found.into_iter().collect())
}

/// Rename references present in `refs` to their `-primary` copies
pub fn rewrite_config_refs(spec: PodSpec, refs: &ConfigRefs) -> Result<PodSpec, CanaryError> {
    let mut value =
        serde_json::to_value(&spec).map_err(|e| CanaryError::Serialization(e.to_string()))?;
    visit_config_refs(&mut value, |type_, name| {
        let primary = name
            .as_str()
            .filter(|n| refs.contains_key(&identity(type_, n)))
            .map(super::metadata::primary_name);
        if let Some(primary) = primary {
            *name = Value::String(primary);
        }
    });
    serde_json::from_value(value).map_err(|e| CanaryError::Serialization(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "tracker_test.rs"]
mod tests;
