//! KEDA resources mirrored from the target onto the primary
//!
//! Only the fields the scaler reconcilers read or copy are modelled.

use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscalerBehavior;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Annotation that pins a ScaledObject at a fixed replica count
pub const PAUSED_REPLICAS_ANNOTATION: &str = "autoscaling.keda.sh/paused-replicas";

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "keda.sh",
    version = "v1alpha1",
    kind = "ScaledObject",
    namespaced,
    status = "ScaledObjectStatus"
)]
pub struct ScaledObjectSpec {
    #[serde(rename = "scaleTargetRef")]
    pub scale_target_ref: ScaleTarget,

    #[serde(rename = "pollingInterval", skip_serializing_if = "Option::is_none")]
    pub polling_interval: Option<i32>,

    #[serde(rename = "initialCooldownPeriod", skip_serializing_if = "Option::is_none")]
    pub initial_cooldown_period: Option<i32>,

    #[serde(rename = "cooldownPeriod", skip_serializing_if = "Option::is_none")]
    pub cooldown_period: Option<i32>,

    #[serde(rename = "idleReplicaCount", skip_serializing_if = "Option::is_none")]
    pub idle_replica_count: Option<i32>,

    #[serde(rename = "minReplicaCount", skip_serializing_if = "Option::is_none")]
    pub min_replica_count: Option<i32>,

    #[serde(rename = "maxReplicaCount", skip_serializing_if = "Option::is_none")]
    pub max_replica_count: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub advanced: Option<AdvancedConfig>,

    #[serde(default)]
    pub triggers: Vec<ScaleTrigger>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Fallback>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ScaleTarget {
    pub name: String,

    #[serde(rename = "apiVersion", skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(rename = "envSourceContainerName", skip_serializing_if = "Option::is_none")]
    pub env_source_container_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct AdvancedConfig {
    #[serde(
        rename = "horizontalPodAutoscalerConfig",
        skip_serializing_if = "Option::is_none"
    )]
    pub horizontal_pod_autoscaler_config: Option<HorizontalPodAutoscalerConfig>,

    #[serde(
        rename = "restoreToOriginalReplicaCount",
        skip_serializing_if = "Option::is_none"
    )]
    pub restore_to_original_replica_count: Option<bool>,

    #[serde(rename = "scalingModifiers", skip_serializing_if = "Option::is_none")]
    pub scaling_modifiers: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct HorizontalPodAutoscalerConfig {
    /// Name of the HPA KEDA creates, defaults to `keda-hpa-{scaledobject}`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub behavior: Option<HorizontalPodAutoscalerBehavior>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ScaleTrigger {
    #[serde(rename = "type")]
    pub type_: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    #[serde(rename = "authenticationRef", skip_serializing_if = "Option::is_none")]
    pub authentication_ref: Option<serde_json::Value>,

    #[serde(rename = "metricType", skip_serializing_if = "Option::is_none")]
    pub metric_type: Option<String>,

    #[serde(rename = "useCachedMetrics", skip_serializing_if = "Option::is_none")]
    pub use_cached_metrics: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Fallback {
    #[serde(rename = "failureThreshold")]
    pub failure_threshold: i32,

    pub replicas: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ScaledObjectStatus {
    #[serde(rename = "hpaName", skip_serializing_if = "Option::is_none")]
    pub hpa_name: Option<String>,

    #[serde(rename = "originalReplicaCount", skip_serializing_if = "Option::is_none")]
    pub original_replica_count: Option<i32>,
}

/// HTTP add-on scaler, scaling on pending HTTP requests
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "http.keda.sh",
    version = "v1alpha1",
    kind = "HTTPScaledObject",
    namespaced
)]
pub struct HTTPScaledObjectSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,

    #[serde(rename = "pathPrefixes", default, skip_serializing_if = "Vec::is_empty")]
    pub path_prefixes: Vec<String>,

    #[serde(rename = "scaleTargetRef")]
    pub scale_target_ref: HTTPScaleTarget,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<ReplicaStruct>,

    #[serde(
        rename = "targetPendingRequests",
        skip_serializing_if = "Option::is_none"
    )]
    pub target_pending_requests: Option<i32>,

    #[serde(rename = "scaledownPeriod", skip_serializing_if = "Option::is_none")]
    pub scaledown_period: Option<i32>,

    #[serde(rename = "scalingMetric", skip_serializing_if = "Option::is_none")]
    pub scaling_metric: Option<serde_json::Value>,

    #[serde(rename = "scalingSet", skip_serializing_if = "Option::is_none")]
    pub scaling_set: Option<HTTPScalingSet>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct HTTPScaleTarget {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(rename = "apiVersion", skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// Service that receives the intercepted traffic
    pub service: String,

    pub port: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ReplicaStruct {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct HTTPScalingSet {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}
