//! StatefulSets
//!
//! Readiness is threshold based: only a percentage of the updated replicas
//! has to be available. There is no progress deadline, a stuck StatefulSet
//! keeps the rollout waiting.

use super::{PodController, PodKind, PodWorkload};
use crate::cluster::Cluster;
use crate::controller::metadata::primary_name;
use crate::controller::{canary_namespace, CanaryError};
use crate::crd::canary::Canary;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use kube::ResourceExt;

pub type StatefulSetController<C> = PodController<C, StatefulSet>;

impl PodWorkload for StatefulSet {
    fn selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|s| &s.selector)
    }

    fn template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }

    fn new_primary(
        &self,
        metadata: ObjectMeta,
        selector: LabelSelector,
        template: PodTemplateSpec,
    ) -> Self {
        let spec = self.spec.clone().unwrap_or_default();
        StatefulSet {
            metadata,
            spec: Some(StatefulSetSpec {
                replicas: Some(spec.replicas.filter(|r| *r > 0).unwrap_or(1)),
                min_ready_seconds: spec.min_ready_seconds,
                revision_history_limit: spec.revision_history_limit,
                update_strategy: spec.update_strategy,
                pod_management_policy: spec.pod_management_policy,
                persistent_volume_claim_retention_policy: spec.persistent_volume_claim_retention_policy,
                volume_claim_templates: spec.volume_claim_templates,
                service_name: spec.service_name,
                selector,
                template,
                ..Default::default()
            }),
            status: None,
        }
    }

    fn promote_from(&mut self, target: &Self, template: PodTemplateSpec, copy_replicas: bool) {
        let source = target.spec.clone().unwrap_or_default();
        let spec = self.spec.get_or_insert_with(Default::default);
        spec.min_ready_seconds = source.min_ready_seconds;
        spec.revision_history_limit = source.revision_history_limit;
        spec.update_strategy = source.update_strategy;
        if copy_replicas {
            spec.replicas = source.replicas;
        }
        spec.template = template;
    }

    fn replicas(&self) -> Option<i32> {
        self.spec.as_ref().and_then(|s| s.replicas)
    }
}

#[async_trait]
impl<C: Cluster> PodKind for PodController<C, StatefulSet> {
    async fn primary_readiness(&self, canary: &Canary) -> Result<(), CanaryError> {
        let primary = self.primary(canary).await?;
        statefulset_ready(&primary, canary.primary_ready_threshold())?;

        if primary.replicas() == Some(0) {
            return Err(CanaryError::not_ready(
                "StatefulSet",
                &canary_namespace(canary)?,
                &primary_name(&canary.spec.target_ref.name),
                "halt advancement: primary is scaled to zero",
                true,
            ));
        }
        Ok(())
    }

    async fn canary_readiness(&self, canary: &Canary) -> Result<(), CanaryError> {
        let target = self.target(canary).await?;
        statefulset_ready(&target, canary.canary_ready_threshold())
    }

    async fn scale_target(&self, canary: &Canary, replicas: i32) -> Result<(), CanaryError> {
        self.set_target_replicas(canary, replicas).await
    }

    async fn scale_down(&self, canary: &Canary) -> Result<(), CanaryError> {
        self.scale_replicas_down(canary).await
    }

    async fn scale_up(&self, canary: &Canary) -> Result<(), CanaryError> {
        self.scale_replicas_up(canary).await
    }

    async fn restore(&self, canary: &Canary) -> Result<(), CanaryError> {
        self.restore_replicas(canary).await
    }
}

/// Whether `threshold` percent of a StatefulSet's updated replicas are available
pub fn statefulset_ready(statefulset: &StatefulSet, threshold: i32) -> Result<(), CanaryError> {
    let namespace = statefulset.namespace().unwrap_or_default();
    let name = statefulset.name_any();
    let not_ready = |reason: String| CanaryError::not_ready("StatefulSet", &namespace, &name, reason, true);

    let status = statefulset.status.clone().unwrap_or_default();
    let generation = statefulset.metadata.generation.unwrap_or_default();
    if generation > status.observed_generation.unwrap_or_default() {
        return Err(not_ready(
            "waiting for rollout to finish: observed generation less than desired generation"
                .to_string(),
        ));
    }

    let updated = status.updated_replicas.unwrap_or_default();
    let replicas = status.replicas;
    let available = status.available_replicas.unwrap_or_default();
    let threshold_updated = (f64::from(updated) * f64::from(threshold) / 100.0) as i32;

    if let Some(desired) = statefulset.spec.as_ref().and_then(|s| s.replicas) {
        if updated < desired {
            return Err(not_ready(format!(
                "waiting for rollout to finish: {updated} out of {desired} new replicas have been updated"
            )));
        }
    }
    if replicas > updated {
        return Err(not_ready(format!(
            "waiting for rollout to finish: {} old replicas are pending termination",
            replicas - updated
        )));
    }
    if available < threshold_updated {
        return Err(not_ready(format!(
            "waiting for rollout to finish: {available} of {threshold_updated} (readyThreshold {threshold}%) updated replicas are available"
        )));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "statefulset_test.rs"]
mod tests;
