//! Knative Serving resources
//!
//! The template is kept as raw JSON so that updates written back to the
//! Service never drop fields this crate does not model.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "serving.knative.dev",
    version = "v1",
    kind = "Service",
    namespaced,
    status = "ServiceStatus"
)]
pub struct ServiceSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traffic: Vec<TrafficTarget>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct TrafficTarget {
    #[serde(rename = "revisionName", skip_serializing_if = "Option::is_none")]
    pub revision_name: Option<String>,

    #[serde(rename = "latestRevision", skip_serializing_if = "Option::is_none")]
    pub latest_revision: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ServiceStatus {
    #[serde(
        rename = "latestCreatedRevisionName",
        skip_serializing_if = "Option::is_none"
    )]
    pub latest_created_revision_name: Option<String>,

    #[serde(
        rename = "latestReadyRevisionName",
        skip_serializing_if = "Option::is_none"
    )]
    pub latest_ready_revision_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traffic: Vec<TrafficTarget>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "serving.knative.dev",
    version = "v1",
    kind = "Revision",
    namespaced,
    status = "RevisionStatus"
)]
pub struct RevisionSpec {
    #[serde(rename = "containerConcurrency", skip_serializing_if = "Option::is_none")]
    pub container_concurrency: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub containers: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct RevisionStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,

    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Revision {
    /// A revision is ready when its `Ready` condition is `True`
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| {
                s.conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false)
    }
}
