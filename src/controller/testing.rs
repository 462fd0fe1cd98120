//! Fixtures shared by the controller tests

#![allow(clippy::expect_used, clippy::unwrap_used)]

use super::clock::MockClock;
use super::Context;
use crate::cluster::memory::MemoryCluster;
use crate::cluster::Backoff;
use crate::config::CoreConfig;
use crate::crd::canary::Canary;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub const NAMESPACE: &str = "test";

/// Instant the mock clock is fixed at
pub const NOW: &str = "2024-05-01T10:00:00Z";

pub fn from_json<K: DeserializeOwned>(value: Value) -> K {
    serde_json::from_value(value).expect("valid fixture")
}

pub fn context(cluster: &MemoryCluster) -> Context<MemoryCluster> {
    context_with(cluster, CoreConfig::default())
}

pub fn context_with(cluster: &MemoryCluster, config: CoreConfig) -> Context<MemoryCluster> {
    Context::new(cluster.clone(), config)
        .with_clock(Arc::new(MockClock::at(NOW)))
        .with_backoff(Backoff {
            steps: 4,
            initial: Duration::from_millis(1),
            factor: 2,
        })
}

/// Canary for `name` targeting a workload of `kind`, stored in `cluster`
///
/// The returned copy carries the uid and resourceVersion assigned on insert.
pub fn canary(cluster: &MemoryCluster, kind: &str, name: &str) -> Canary {
    canary_from(cluster, canary_json(kind, name))
}

pub fn canary_json(kind: &str, name: &str) -> Value {
    let api_version = match kind {
        "Service" => "v1",
        _ => "apps/v1",
    };
    json!({
        "apiVersion": "kanari.io/v1beta1",
        "kind": "Canary",
        "metadata": {"name": name, "namespace": NAMESPACE},
        "spec": {
            "targetRef": {"apiVersion": api_version, "kind": kind, "name": name},
            "service": {"port": 80, "targetPort": 9898},
            "analysis": {"interval": "1m", "threshold": 5, "maxWeight": 50, "stepWeight": 10}
        }
    })
}

pub fn canary_from(cluster: &MemoryCluster, value: Value) -> Canary {
    let canary: Canary = from_json(value);
    let name = canary.metadata.name.clone().unwrap();
    cluster.insert(canary);
    reload(cluster, &name)
}

/// Current stored copy of a Canary
pub fn reload(cluster: &MemoryCluster, name: &str) -> Canary {
    cluster.object::<Canary>(NAMESPACE, name).expect("canary stored")
}

pub fn pod_template(name: &str) -> Value {
    json!({
        "metadata": {
            "labels": {"app": name},
            "annotations": {"prometheus.io/scrape": "true"}
        },
        "spec": {
            "containers": [{
                "name": name,
                "image": "ghcr.io/stefanprodan/podinfo:6.0.0",
                "ports": [
                    {"name": "http", "containerPort": 9898},
                    {"name": "grpc", "containerPort": 9999}
                ],
                "env": [{
                    "name": "PODINFO_UI_COLOR",
                    "valueFrom": {"configMapKeyRef": {"name": "podinfo-config-env", "key": "color"}}
                }],
                "envFrom": [{"secretRef": {"name": "podinfo-secret-env"}}]
            }],
            "volumes": [{"name": "config", "configMap": {"name": "podinfo-config-vol"}}]
        }
    })
}

pub fn deployment_json(name: &str, replicas: i32) -> Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": name,
            "namespace": NAMESPACE,
            "labels": {"app": name, "app.kubernetes.io/name": name}
        },
        "spec": {
            "replicas": replicas,
            "minReadySeconds": 3,
            "revisionHistoryLimit": 5,
            "progressDeadlineSeconds": 60,
            "strategy": {"type": "RollingUpdate", "rollingUpdate": {"maxUnavailable": 0}},
            "selector": {"matchLabels": {"app": name}},
            "template": pod_template(name)
        }
    })
}

pub fn deployment(name: &str, replicas: i32) -> Deployment {
    from_json(deployment_json(name, replicas))
}

/// ConfigMaps and Secret referenced by [`pod_template`]
pub fn insert_podinfo_configs(cluster: &MemoryCluster) {
    cluster.insert(config_map("podinfo-config-env", &[("color", "blue")]));
    cluster.insert(config_map("podinfo-config-vol", &[("output", "console")]));
    cluster.insert(secret("podinfo-secret-env", "Opaque", &[("user", "YWRtaW4=")]));
}

pub fn config_map(name: &str, data: &[(&str, &str)]) -> ConfigMap {
    let data: serde_json::Map<String, Value> =
        data.iter().map(|(k, v)| (k.to_string(), json!(v))).collect();
    from_json(json!({
        "metadata": {"name": name, "namespace": NAMESPACE},
        "data": data
    }))
}

/// Secret with base64 encoded `data` values
pub fn secret(name: &str, type_: &str, data: &[(&str, &str)]) -> Secret {
    let data: serde_json::Map<String, Value> =
        data.iter().map(|(k, v)| (k.to_string(), json!(v))).collect();
    from_json(json!({
        "metadata": {"name": name, "namespace": NAMESPACE},
        "type": type_,
        "data": data
    }))
}

/// Report a Deployment as fully rolled out
pub fn mark_deployment_ready(cluster: &MemoryCluster, name: &str) {
    let current: Deployment = cluster.object(NAMESPACE, name).expect("deployment stored");
    let generation = current.metadata.generation.unwrap_or(1);
    let replicas = current.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    cluster.set_status::<Deployment>(
        NAMESPACE,
        name,
        json!({
            "observedGeneration": generation,
            "replicas": replicas,
            "updatedReplicas": replicas,
            "readyReplicas": replicas,
            "availableReplicas": replicas,
            "conditions": [
                {"type": "Available", "status": "True", "reason": "MinimumReplicasAvailable",
                 "lastUpdateTime": NOW, "lastTransitionTime": NOW},
                {"type": "Progressing", "status": "True", "reason": "NewReplicaSetAvailable",
                 "lastUpdateTime": NOW, "lastTransitionTime": NOW}
            ]
        }),
    );
}
