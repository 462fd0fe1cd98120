use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default time a rollout may make no progress before it is considered stuck
pub const DEFAULT_PROGRESS_DEADLINE_SECONDS: i32 = 600;

/// Default percentage of ready replicas required for a workload to be ready
pub const DEFAULT_READY_THRESHOLD: i32 = 100;

/// Canary declares a progressive rollout of a target workload
///
/// The controller keeps a `{target}-primary` copy of the target converged and
/// exposes readiness, drift and scaling primitives to the analysis scheduler.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "kanari.io",
    version = "v1beta1",
    kind = "Canary",
    namespaced,
    status = "CanaryStatus",
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Weight", "type":"integer", "jsonPath":".status.canaryWeight"}"#,
    printcolumn = r#"{"name":"LastTransitionTime", "type":"string", "jsonPath":".status.lastTransitionTime"}"#
)]
pub struct CanarySpec {
    /// Reference to the workload the user edits to trigger a rollout
    #[serde(rename = "targetRef")]
    pub target_ref: TargetReference,

    /// Autoscaler bound to the target, mirrored onto the primary
    #[serde(rename = "autoscalerRef", skip_serializing_if = "Option::is_none")]
    pub autoscaler_ref: Option<AutoscalerReference>,

    /// Service and port configuration
    #[serde(default)]
    pub service: CanaryService,

    /// Seconds a rollout may make no progress before it is judged stuck.
    /// Defaults to 600 when not specified.
    #[serde(
        rename = "progressDeadlineSeconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub progress_deadline_seconds: Option<i32>,

    /// Promote without running the analysis
    #[serde(rename = "skipAnalysis", default)]
    pub skip_analysis: bool,

    /// Analysis parameters consumed by the scheduler
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<CanaryAnalysis>,
}

/// Kind, name and API version of the target workload
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct TargetReference {
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,

    pub kind: String,

    pub name: String,
}

impl TargetReference {
    /// Knative Services share the `Service` kind with core Services
    pub fn is_knative_service(&self) -> bool {
        self.kind == "Service" && self.api_version.starts_with("serving.knative.dev")
    }
}

/// Autoscaler attached to the target
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct AutoscalerReference {
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,

    /// HorizontalPodAutoscaler, ScaledObject or HTTPScaledObject
    pub kind: String,

    pub name: String,

    /// Queries for the primary ScaledObject keyed by trigger name
    #[serde(
        rename = "primaryScalerQueries",
        skip_serializing_if = "Option::is_none"
    )]
    pub primary_scaler_queries: Option<BTreeMap<String, String>>,

    /// Replica bounds overriding those of the target's autoscaler
    #[serde(
        rename = "primaryScalerReplicas",
        skip_serializing_if = "Option::is_none"
    )]
    pub primary_scaler_replicas: Option<ScalerReplicas>,

    /// Scaling set for the primary HTTPScaledObject
    #[serde(rename = "primaryScalingSet", skip_serializing_if = "Option::is_none")]
    pub primary_scaling_set: Option<ScalingSetReference>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ScalerReplicas {
    #[serde(rename = "minReplicas", skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,

    #[serde(rename = "maxReplicas", skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ScalingSetReference {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Service exposing the canary and primary workloads
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CanaryService {
    /// Service name, defaults to the target name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Port exposed by the service
    #[serde(default)]
    pub port: i32,

    #[serde(rename = "portName", skip_serializing_if = "Option::is_none")]
    pub port_name: Option<String>,

    /// Container port or named port the service forwards to
    #[serde(rename = "targetPort", skip_serializing_if = "Option::is_none")]
    pub target_port: Option<IntOrString>,

    /// Expose every container port of the target, not just `port`
    #[serde(rename = "portDiscovery", default)]
    pub port_discovery: bool,
}

/// Analysis parameters
///
/// Only the ready thresholds are read by the workload controllers; the rest
/// is carried for the scheduler.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct CanaryAnalysis {
    /// Schedule interval, e.g. "1m"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// Failed checks tolerated before rollback
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<i32>,

    #[serde(rename = "maxWeight", skip_serializing_if = "Option::is_none")]
    pub max_weight: Option<i32>,

    #[serde(rename = "stepWeight", skip_serializing_if = "Option::is_none")]
    pub step_weight: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<i32>,

    /// Percentage of primary replicas that must be available
    #[serde(
        rename = "primaryReadyThreshold",
        skip_serializing_if = "Option::is_none"
    )]
    pub primary_ready_threshold: Option<i32>,

    /// Percentage of canary replicas that must be available
    #[serde(
        rename = "canaryReadyThreshold",
        skip_serializing_if = "Option::is_none"
    )]
    pub canary_ready_threshold: Option<i32>,
}

/// Phase of a Canary
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum CanaryPhase {
    /// Primary is being created
    #[default]
    Initializing,
    /// Primary exists and serves traffic
    Initialized,
    /// Waiting for confirmation to start
    Waiting,
    /// Analysis is shifting traffic to the canary
    Progressing,
    /// Target spec is being copied to the primary
    Promoting,
    /// Traffic is routed back to the primary
    Finalising,
    /// Promotion finished
    Succeeded,
    /// Rollout aborted
    Failed,
}

impl CanaryPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CanaryPhase::Initializing => "Initializing",
            CanaryPhase::Initialized => "Initialized",
            CanaryPhase::Waiting => "Waiting",
            CanaryPhase::Progressing => "Progressing",
            CanaryPhase::Promoting => "Promoting",
            CanaryPhase::Finalising => "Finalising",
            CanaryPhase::Succeeded => "Succeeded",
            CanaryPhase::Failed => "Failed",
        }
    }
}

/// Status of a Canary, owned by the controller
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CanaryStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<CanaryPhase>,

    #[serde(rename = "failedChecks", default)]
    pub failed_checks: i32,

    #[serde(rename = "canaryWeight", default)]
    pub canary_weight: i32,

    #[serde(default)]
    pub iterations: i32,

    /// Fingerprint of the target spec at the last status sync
    #[serde(rename = "lastAppliedSpec", skip_serializing_if = "Option::is_none")]
    pub last_applied_spec: Option<String>,

    /// Fingerprint of the target spec at the last promotion
    #[serde(rename = "lastPromotedSpec", skip_serializing_if = "Option::is_none")]
    pub last_promoted_spec: Option<String>,

    /// Checksums of tracked ConfigMaps and Secrets keyed by `{kind}/{name}`
    #[serde(rename = "trackedConfigs", skip_serializing_if = "Option::is_none")]
    pub tracked_configs: Option<BTreeMap<String, String>>,

    /// RFC3339 timestamp of the last status sync
    #[serde(
        rename = "lastTransitionTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_transition_time: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<CanaryCondition>,
}

/// Condition reported on the Canary status
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct CanaryCondition {
    #[serde(rename = "type")]
    pub type_: String,

    /// "True", "False" or "Unknown"
    pub status: String,

    #[serde(rename = "lastUpdateTime", skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,

    #[serde(
        rename = "lastTransitionTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_transition_time: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Canary {
    /// Current phase, `Initializing` when no status has been written yet
    pub fn phase(&self) -> CanaryPhase {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .unwrap_or_default()
    }

    pub fn progress_deadline_seconds(&self, default: i32) -> i32 {
        self.spec.progress_deadline_seconds.unwrap_or(default)
    }

    pub fn primary_ready_threshold(&self) -> i32 {
        self.spec
            .analysis
            .as_ref()
            .and_then(|a| a.primary_ready_threshold)
            .unwrap_or(DEFAULT_READY_THRESHOLD)
    }

    pub fn canary_ready_threshold(&self) -> i32 {
        self.spec
            .analysis
            .as_ref()
            .and_then(|a| a.canary_ready_threshold)
            .unwrap_or(DEFAULT_READY_THRESHOLD)
    }

    /// Name of the service fronting the workloads
    pub fn service_name(&self) -> &str {
        self.spec
            .service
            .name
            .as_deref()
            .unwrap_or(&self.spec.target_ref.name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "canary_test.rs"]
mod tests;
