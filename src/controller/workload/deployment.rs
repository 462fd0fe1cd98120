//! Deployments
//!
//! Readiness follows `kubectl rollout status`: the rollout must be observed,
//! every replica updated, no old replicas left and every updated replica
//! available. A rollout whose `Available` condition has reported
//! `MinimumReplicasUnavailable` for longer than the progress deadline is
//! stuck rather than slow.

use super::{PodController, PodKind, PodWorkload};
use crate::cluster::Cluster;
use crate::controller::clock::deadline_exceeded;
use crate::controller::metadata::primary_name;
use crate::controller::{canary_namespace, CanaryError};
use crate::crd::canary::Canary;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentCondition, DeploymentSpec};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use kube::ResourceExt;

pub type DeploymentController<C> = PodController<C, Deployment>;

impl PodWorkload for Deployment {
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
        Deployment {
            metadata,
            spec: Some(DeploymentSpec {
                progress_deadline_seconds: spec.progress_deadline_seconds,
                min_ready_seconds: spec.min_ready_seconds,
                revision_history_limit: spec.revision_history_limit,
                replicas: Some(spec.replicas.filter(|r| *r > 0).unwrap_or(1)),
                strategy: spec.strategy,
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
        spec.progress_deadline_seconds = source.progress_deadline_seconds;
        spec.min_ready_seconds = source.min_ready_seconds;
        spec.revision_history_limit = source.revision_history_limit;
        spec.strategy = source.strategy;
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
impl<C: Cluster> PodKind for PodController<C, Deployment> {
    async fn primary_readiness(&self, canary: &Canary) -> Result<(), CanaryError> {
        let primary = self.primary(canary).await?;
        self.deployment_readiness(canary, &primary)?;

        if primary.replicas() == Some(0) {
            return Err(CanaryError::not_ready(
                "Deployment",
                &canary_namespace(canary)?,
                &primary_name(&canary.spec.target_ref.name),
                "primary is scaled to zero",
                true,
            ));
        }
        Ok(())
    }

    async fn canary_readiness(&self, canary: &Canary) -> Result<(), CanaryError> {
        let target = self.target(canary).await?;
        self.deployment_readiness(canary, &target)
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

impl<C: Cluster> PodController<C, Deployment> {
    fn deployment_readiness(&self, canary: &Canary, deployment: &Deployment) -> Result<(), CanaryError> {
        let deadline = canary.progress_deadline_seconds(self.ctx.config.progress_deadline_seconds);
        deployment_ready(deployment, deadline, self.ctx.clock.now())
    }
}

fn condition<'a>(deployment: &'a Deployment, type_: &str) -> Option<&'a DeploymentCondition> {
    deployment
        .status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == type_)
}

/// Whether a Deployment has finished rolling out
///
/// Returns `Ok(())` when ready. A `ProgressDeadlineExceeded` progress
/// condition is fatal, and so is any wait once the deployment has lacked
/// minimum availability for longer than `deadline_seconds`.
pub fn deployment_ready(
    deployment: &Deployment,
    deadline_seconds: i32,
    now: DateTime<Utc>,
) -> Result<(), CanaryError> {
    let namespace = deployment.namespace().unwrap_or_default();
    let name = deployment.name_any();
    let not_ready = |reason: String, retryable: bool| {
        CanaryError::not_ready("Deployment", &namespace, &name, reason, retryable)
    };

    let status = deployment.status.clone().unwrap_or_default();
    let generation = deployment.metadata.generation.unwrap_or_default();
    if generation > status.observed_generation.unwrap_or_default() {
        return Err(not_ready(
            "waiting for rollout to finish: observed generation less than desired generation"
                .to_string(),
            true,
        ));
    }

    let progress = condition(deployment, "Progressing");
    if progress.and_then(|c| c.reason.as_deref()) == Some("ProgressDeadlineExceeded") {
        return Err(not_ready(
            format!("deployment {name:?} exceeded its progress deadline"),
            false,
        ));
    }

    // Stuck: minimum availability missing for longer than the deadline
    let mut retryable = true;
    if progress.is_some() {
        if let Some(available) = condition(deployment, "Available") {
            if available.status == "False"
                && available.reason.as_deref() == Some("MinimumReplicasUnavailable")
            {
                let since = available
                    .last_update_time
                    .as_ref()
                    .or(available.last_transition_time.as_ref())
                    .map(|t| t.0);
                if let Some(since) = since {
                    retryable = !deadline_exceeded(since, deadline_seconds, now);
                }
            }
        }
    }

    let updated = status.updated_replicas.unwrap_or_default();
    let replicas = status.replicas.unwrap_or_default();
    let available = status.available_replicas.unwrap_or_default();

    if let Some(desired) = deployment.spec.as_ref().and_then(|s| s.replicas) {
        if updated < desired {
            return Err(not_ready(
                format!("waiting for rollout to finish: {updated} out of {desired} new replicas have been updated"),
                retryable,
            ));
        }
    }
    if replicas > updated {
        return Err(not_ready(
            format!(
                "waiting for rollout to finish: {} old replicas are pending termination",
                replicas - updated
            ),
            retryable,
        ));
    }
    if available < updated {
        return Err(not_ready(
            format!("waiting for rollout to finish: {available} of {updated} updated replicas are available"),
            retryable,
        ));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "deployment_test.rs"]
mod tests;
