//! `autoscaling/v2beta2` HorizontalPodAutoscaler
//!
//! Clusters older than 1.23 only serve this version. The fields the HPA
//! reconciler reads and writes have the same wire shape as `autoscaling/v2`,
//! so the v2 spec and status types are reused.

use k8s_openapi::api::autoscaling::v2::{HorizontalPodAutoscalerSpec, HorizontalPodAutoscalerStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct HorizontalPodAutoscalerV2beta2 {
    #[serde(rename = "apiVersion", default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,

    pub metadata: ObjectMeta,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec: Option<HorizontalPodAutoscalerSpec>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<HorizontalPodAutoscalerStatus>,
}

impl HorizontalPodAutoscalerV2beta2 {
    pub fn new(metadata: ObjectMeta, spec: HorizontalPodAutoscalerSpec) -> Self {
        Self {
            api_version: "autoscaling/v2beta2".to_string(),
            kind: "HorizontalPodAutoscaler".to_string(),
            metadata,
            spec: Some(spec),
            status: None,
        }
    }
}

impl kube::Resource for HorizontalPodAutoscalerV2beta2 {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        Cow::Borrowed("HorizontalPodAutoscaler")
    }

    fn group(_: &()) -> Cow<'_, str> {
        Cow::Borrowed("autoscaling")
    }

    fn version(_: &()) -> Cow<'_, str> {
        Cow::Borrowed("v2beta2")
    }

    fn api_version(_: &()) -> Cow<'_, str> {
        Cow::Borrowed("autoscaling/v2beta2")
    }

    fn plural(_: &()) -> Cow<'_, str> {
        Cow::Borrowed("horizontalpodautoscalers")
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
