//! DaemonSets
//!
//! A DaemonSet has no replica count. It is scaled to zero by adding a
//! node selector no node matches, and scaled back up by removing it again.

use super::{PodController, PodKind, PodWorkload};
use crate::cluster::Cluster;
use crate::controller::clock::{deadline_exceeded, parse_rfc3339};
use crate::controller::{CanaryError, Context};
use crate::crd::canary::Canary;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use serde_json::{json, Map, Value};
use tracing::info;

/// Node selector key that keeps a DaemonSet off every node
pub const SCALE_TO_ZERO_KEY: &str = "kanari.io/scale-to-zero";

pub type DaemonSetController<C> = PodController<C, DaemonSet>;

fn node_selector(daemonset: &DaemonSet) -> Option<&std::collections::BTreeMap<String, String>> {
    daemonset
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .node_selector
        .as_ref()
}

/// Merge patch setting the scale-to-zero node selector to `value`
fn node_selector_patch(value: Value) -> Value {
    let mut selector = Map::new();
    selector.insert(SCALE_TO_ZERO_KEY.to_string(), value);
    json!({ "spec": { "template": { "spec": { "nodeSelector": selector }}}})
}

impl PodWorkload for DaemonSet {
    fn selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|s| &s.selector)
    }

    fn template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }

    fn validate(&self) -> Result<(), String> {
        let strategy = self
            .spec
            .as_ref()
            .and_then(|s| s.update_strategy.as_ref())
            .and_then(|s| s.type_.as_deref());
        match strategy {
            None | Some("RollingUpdate") => Ok(()),
            Some(other) => Err(format!(
                "update strategy {other} is not supported, only RollingUpdate is"
            )),
        }
    }

    fn new_primary(
        &self,
        metadata: ObjectMeta,
        selector: LabelSelector,
        template: PodTemplateSpec,
    ) -> Self {
        let spec = self.spec.clone().unwrap_or_default();
        DaemonSet {
            metadata,
            spec: Some(DaemonSetSpec {
                min_ready_seconds: spec.min_ready_seconds,
                revision_history_limit: spec.revision_history_limit,
                update_strategy: spec.update_strategy,
                selector,
                template,
            }),
            status: None,
        }
    }

    fn promote_from(&mut self, target: &Self, template: PodTemplateSpec, _copy_replicas: bool) {
        let source = target.spec.clone().unwrap_or_default();
        let spec = self.spec.get_or_insert_with(Default::default);
        spec.min_ready_seconds = source.min_ready_seconds;
        spec.revision_history_limit = source.revision_history_limit;
        spec.update_strategy = source.update_strategy;
        spec.template = template;
    }

    /// The scale-to-zero selector never reaches the primary
    fn promotable_template(&self) -> Option<PodTemplateSpec> {
        let mut template = self.template()?.clone();
        if let Some(spec) = template.spec.as_mut() {
            if let Some(selector) = spec.node_selector.as_mut() {
                selector.remove(SCALE_TO_ZERO_KEY);
                if selector.is_empty() {
                    spec.node_selector = None;
                }
            }
        }
        Some(template)
    }
}

#[async_trait]
impl<C: Cluster> PodKind for PodController<C, DaemonSet> {
    async fn primary_readiness(&self, canary: &Canary) -> Result<(), CanaryError> {
        let primary = self.primary(canary).await?;
        daemonset_ready(&self.ctx, canary, &primary)
    }

    async fn canary_readiness(&self, canary: &Canary) -> Result<(), CanaryError> {
        let target = self.target(canary).await?;
        daemonset_ready(&self.ctx, canary, &target)
    }

    async fn scale_target(&self, _canary: &Canary, _replicas: i32) -> Result<(), CanaryError> {
        Ok(())
    }

    async fn scale_down(&self, canary: &Canary) -> Result<(), CanaryError> {
        let changed = self
            .patch_target(canary, |target| {
                let scaled = node_selector(target).is_some_and(|s| s.contains_key(SCALE_TO_ZERO_KEY));
                (!scaled).then(|| node_selector_patch(Value::from("true")))
            })
            .await?;
        if changed {
            info!(canary = %canary.name_any(), namespace = ?canary.namespace(), "DaemonSet scaled to zero");
        }
        Ok(())
    }

    async fn scale_up(&self, canary: &Canary) -> Result<(), CanaryError> {
        let changed = self
            .patch_target(canary, |target| {
                let selector = node_selector(target)?;
                if !selector.contains_key(SCALE_TO_ZERO_KEY) {
                    return None;
                }
                // Drop the whole selector when nothing else is left in it
                if selector.len() == 1 {
                    return Some(json!({ "spec": { "template": { "spec": { "nodeSelector": null }}}}));
                }
                Some(node_selector_patch(Value::Null))
            })
            .await?;
        if changed {
            info!(canary = %canary.name_any(), namespace = ?canary.namespace(), "DaemonSet scaled up");
        }
        Ok(())
    }

    async fn restore(&self, canary: &Canary) -> Result<(), CanaryError> {
        self.scale_up(canary).await
    }
}

/// Whether every desired pod of the DaemonSet is updated and available
///
/// Waiting is fatal once the Canary's last transition is older than its
/// progress deadline.
fn daemonset_ready<C: Cluster>(
    ctx: &Context<C>,
    canary: &Canary,
    daemonset: &DaemonSet,
) -> Result<(), CanaryError> {
    let namespace = daemonset.namespace().unwrap_or_default();
    let name = daemonset.name_any();
    let status = daemonset.status.clone().unwrap_or_default();

    let generation = daemonset.metadata.generation.unwrap_or_default();
    if generation > status.observed_generation.unwrap_or_default() {
        return Err(CanaryError::not_ready(
            "DaemonSet",
            &namespace,
            &name,
            "waiting for rollout to finish: observed generation less than desired generation",
            true,
        ));
    }

    let desired = status.desired_number_scheduled;
    let updated = status.updated_number_scheduled.unwrap_or_default();
    let available = status.number_available.unwrap_or_default();
    if updated >= desired && available >= desired {
        return Ok(());
    }

    let deadline = canary.progress_deadline_seconds(ctx.config.progress_deadline_seconds);
    let stuck = canary
        .status
        .as_ref()
        .and_then(|s| s.last_transition_time.as_deref())
        .and_then(parse_rfc3339)
        .is_some_and(|since| deadline_exceeded(since, deadline, ctx.clock.now()));
    if stuck {
        return Err(CanaryError::not_ready(
            "DaemonSet",
            &namespace,
            &name,
            format!("daemonset {name:?} exceeded its progress deadline"),
            false,
        ));
    }

    let reason = if updated < desired {
        format!("waiting for rollout to finish: {updated} out of {desired} new pods have been updated")
    } else {
        format!("waiting for rollout to finish: {available} of {desired} updated pods are available")
    };
    Err(CanaryError::not_ready("DaemonSet", &namespace, &name, reason, true))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "daemonset_test.rs"]
mod tests;
