//! In-memory [`Cluster`] for tests
//!
//! Objects are stored as JSON keyed by API version, kind, namespace and name.
//! Every write bumps a global resourceVersion; writes carrying a stale
//! version fail with a conflict, and conflicts can be injected per object.
//! Main-resource writes never touch `.status`, mirroring the status
//! subresource.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use super::{object_name, Cluster, ClusterError, ClusterResource};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

type Key = (String, String, String);

#[derive(Clone, Default)]
pub struct MemoryCluster {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    version: u64,
    conflicts: BTreeMap<Key, usize>,
    writes: usize,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn take_conflict(&mut self, key: &Key) -> bool {
        match self.conflicts.get_mut(key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

fn type_key<K: ClusterResource>() -> String {
    format!("{}/{}", K::api_version(&()), K::kind(&()))
}

fn key<K: ClusterResource>(namespace: &str, name: &str) -> Key {
    (type_key::<K>(), namespace.to_string(), name.to_string())
}

fn resource_version(value: &Value) -> Option<&str> {
    value["metadata"]["resourceVersion"].as_str()
}

/// RFC 7386 JSON merge patch
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(target) = target {
                for (key, value) in entries {
                    if value.is_null() {
                        target.remove(key);
                    } else {
                        merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        _ => *target = patch.clone(),
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object, status included, as if another actor created it
    pub fn insert<K: ClusterResource>(&self, object: K) {
        let namespace = object.meta().namespace.clone().unwrap_or_default();
        let name = object_name(&object);
        let mut value = serde_json::to_value(&object).expect("serialize fixture");
        let mut state = self.state.lock().expect("lock");
        value["apiVersion"] = json!(K::api_version(&()));
        value["kind"] = json!(K::kind(&()));
        value["metadata"]["namespace"] = json!(namespace);
        if value["metadata"]["uid"].is_null() {
            value["metadata"]["uid"] = json!(uuid::Uuid::new_v4().to_string());
        }
        if value["metadata"]["generation"].is_null() {
            value["metadata"]["generation"] = json!(1);
        }
        value["metadata"]["resourceVersion"] = json!(state.next_version());
        state.objects.insert(key::<K>(&namespace, &name), value);
    }

    /// Read an object without going through the async API
    pub fn object<K: ClusterResource>(&self, namespace: &str, name: &str) -> Option<K> {
        let state = self.state.lock().expect("lock");
        state
            .objects
            .get(&key::<K>(namespace, name))
            .map(|v| serde_json::from_value(v.clone()).expect("deserialize stored object"))
    }

    /// Stored JSON of an object, fields the typed struct does not model included
    pub fn raw<K: ClusterResource>(&self, namespace: &str, name: &str) -> Option<Value> {
        let state = self.state.lock().expect("lock");
        state.objects.get(&key::<K>(namespace, name)).cloned()
    }

    pub fn contains<K: ClusterResource>(&self, namespace: &str, name: &str) -> bool {
        let state = self.state.lock().expect("lock");
        state.objects.contains_key(&key::<K>(namespace, name))
    }

    /// Number of stored objects of one type
    pub fn count<K: ClusterResource>(&self) -> usize {
        let type_key = type_key::<K>();
        let state = self.state.lock().expect("lock");
        state.objects.keys().filter(|k| k.0 == type_key).count()
    }

    /// Apply a merge patch to an object's status, as the owning controller would
    pub fn set_status<K: ClusterResource>(&self, namespace: &str, name: &str, status: Value) {
        let mut state = self.state.lock().expect("lock");
        let version = state.next_version();
        let object = state
            .objects
            .get_mut(&key::<K>(namespace, name))
            .expect("object to set status on");
        merge_patch(&mut object["status"], &status);
        object["metadata"]["resourceVersion"] = json!(version);
    }

    /// Apply a merge patch to an object outside the controllers' view
    pub fn modify<K: ClusterResource>(&self, namespace: &str, name: &str, patch: Value) {
        let mut state = self.state.lock().expect("lock");
        let version = state.next_version();
        let object = state
            .objects
            .get_mut(&key::<K>(namespace, name))
            .expect("object to modify");
        merge_patch(object, &patch);
        let generation = object["metadata"]["generation"].as_i64().unwrap_or(1);
        object["metadata"]["generation"] = json!(generation + 1);
        object["metadata"]["resourceVersion"] = json!(version);
    }

    /// Make the next `times` writes to an object fail with a conflict
    pub fn fail_with_conflict<K: ClusterResource>(&self, namespace: &str, name: &str, times: usize) {
        let mut state = self.state.lock().expect("lock");
        state.conflicts.insert(key::<K>(namespace, name), times);
    }

    /// Successful writes made through the [`Cluster`] API
    pub fn writes(&self) -> usize {
        self.state.lock().expect("lock").writes
    }

    fn write<K: ClusterResource>(
        &self,
        namespace: &str,
        name: &str,
        precondition: Option<&str>,
        apply: impl FnOnce(&mut Value) -> Result<(), ClusterError>,
    ) -> Result<K, ClusterError> {
        let key = key::<K>(namespace, name);
        let mut state = self.state.lock().expect("lock");
        if !state.objects.contains_key(&key) {
            return Err(ClusterError::not_found::<K>(namespace, name));
        }
        if state.take_conflict(&key) {
            return Err(ClusterError::conflict::<K>(namespace, name));
        }
        let version = state.next_version();
        let stored = state.objects.get_mut(&key).expect("checked above");
        if let Some(expected) = precondition {
            if resource_version(stored) != Some(expected) {
                return Err(ClusterError::conflict::<K>(namespace, name));
            }
        }

        let mut updated = stored.clone();
        apply(&mut updated)?;
        if updated["spec"] != stored["spec"] {
            let generation = stored["metadata"]["generation"].as_i64().unwrap_or(1);
            updated["metadata"]["generation"] = json!(generation + 1);
        }
        updated["metadata"]["resourceVersion"] = json!(version);
        *stored = updated.clone();
        state.writes += 1;

        serde_json::from_value(updated)
            .map_err(|e| ClusterError::serialization::<K>(namespace, name, e))
    }
}

#[async_trait]
impl Cluster for MemoryCluster {
    async fn get<K: ClusterResource>(&self, namespace: &str, name: &str) -> Result<K, ClusterError> {
        let value = {
            let state = self.state.lock().expect("lock");
            state.objects.get(&key::<K>(namespace, name)).cloned()
        };
        match value {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| ClusterError::serialization::<K>(namespace, name, e)),
            None => Err(ClusterError::not_found::<K>(namespace, name)),
        }
    }

    async fn create<K: ClusterResource>(
        &self,
        namespace: &str,
        object: &K,
    ) -> Result<K, ClusterError> {
        let name = object_name(object);
        let mut value = serde_json::to_value(object)
            .map_err(|e| ClusterError::serialization::<K>(namespace, &name, e))?;
        let key = key::<K>(namespace, &name);

        let mut state = self.state.lock().expect("lock");
        if state.objects.contains_key(&key) {
            return Err(ClusterError::already_exists::<K>(namespace, &name));
        }
        value["apiVersion"] = json!(K::api_version(&()));
        value["kind"] = json!(K::kind(&()));
        value["metadata"]["namespace"] = json!(namespace);
        value["metadata"]["uid"] = json!(uuid::Uuid::new_v4().to_string());
        value["metadata"]["generation"] = json!(1);
        value["metadata"]["resourceVersion"] = json!(state.next_version());
        state.objects.insert(key, value.clone());
        state.writes += 1;

        serde_json::from_value(value)
            .map_err(|e| ClusterError::serialization::<K>(namespace, &name, e))
    }

    async fn replace<K: ClusterResource>(
        &self,
        namespace: &str,
        object: &K,
    ) -> Result<K, ClusterError> {
        let name = object_name(object);
        let value = serde_json::to_value(object)
            .map_err(|e| ClusterError::serialization::<K>(namespace, &name, e))?;
        let precondition = resource_version(&value).map(str::to_string);

        self.write::<K>(namespace, &name, precondition.as_deref(), |stored| {
            let status = stored["status"].take();
            let uid = stored["metadata"]["uid"].take();
            let generation = stored["metadata"]["generation"].take();
            *stored = value;
            stored["apiVersion"] = json!(K::api_version(&()));
            stored["kind"] = json!(K::kind(&()));
            stored["metadata"]["namespace"] = json!(namespace);
            stored["metadata"]["uid"] = uid;
            stored["metadata"]["generation"] = generation;
            if let Some(map) = stored.as_object_mut() {
                map.remove("status");
            }
            if !status.is_null() {
                stored["status"] = status;
            }
            Ok(())
        })
    }

    async fn patch<K: ClusterResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, ClusterError> {
        let mut patch = patch.clone();
        if let Some(map) = patch.as_object_mut() {
            map.remove("status");
        }
        let precondition = resource_version(&patch).map(str::to_string);
        if let Some(metadata) = patch.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.remove("resourceVersion");
        }

        self.write::<K>(namespace, name, precondition.as_deref(), |stored| {
            merge_patch(stored, &patch);
            Ok(())
        })
    }

    async fn patch_status<K: ClusterResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, ClusterError> {
        let precondition = resource_version(patch).map(str::to_string);
        let status = patch["status"].clone();

        self.write::<K>(namespace, name, precondition.as_deref(), |stored| {
            merge_patch(&mut stored["status"], &status);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn config_map(data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("cm".to_string()),
                namespace: Some("test".to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_stale_replace_conflicts() {
        let cluster = MemoryCluster::new();
        cluster.insert(config_map(&[("color", "red")]));

        let stale: ConfigMap = cluster.get("test", "cm").await.unwrap();
        let mut fresh = stale.clone();
        fresh.data = Some(BTreeMap::from([("color".to_string(), "blue".to_string())]));
        cluster.replace("test", &fresh).await.unwrap();

        let err = cluster.replace("test", &stale).await.unwrap_err();
        assert!(err.is_conflict());
        let stored: ConfigMap = cluster.object("test", "cm").unwrap();
        assert_eq!(stored.data.unwrap()["color"], "blue");
    }

    #[tokio::test]
    async fn test_create_twice_already_exists() {
        let cluster = MemoryCluster::new();
        cluster.create("test", &config_map(&[])).await.unwrap();

        let err = cluster.create("test", &config_map(&[])).await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(cluster.count::<ConfigMap>(), 1);
    }

    #[test]
    fn test_merge_patch_removes_null_keys() {
        let mut target = json!({"a": {"b": 1, "c": 2}, "d": 3});
        merge_patch(&mut target, &json!({"a": {"b": null, "e": 4}, "d": [1]}));
        assert_eq!(target, json!({"a": {"c": 2, "e": 4}, "d": [1]}));
    }
}
