//! Controllers for the kinds of workload a Canary can target
//!
//! Deployments, DaemonSets and StatefulSets share [`PodController`]. The
//! primary is a copy of the target whose selector label value carries the
//! `-primary` suffix and whose ConfigMap/Secret references point at primary
//! copies. Its pod template also gets a fresh rollout id on every build.
//! The kinds only differ in how they copy rollout settings, judge readiness
//! and scale to zero, which is what [`PodWorkload`] and [`PodKind`] capture.
//!
//! Plain Services and Knative Services have no pod template and get their
//! own controllers.

pub mod daemonset;
pub mod deployment;
pub mod knative;
pub mod service;
pub mod statefulset;

pub use knative::KnativeController;
pub use service::ServiceController;

use super::metadata::{
    discover_ports, filter_metadata, include_labels_by_prefix, make_annotations,
    make_primary_labels, primary_name, retarget_pod_selectors, selector_label,
};
use super::scaler::ScalerReconciler;
use super::spec::{compute_hash, has_spec_changed};
use super::status::{StatusStore, StatusWriter};
use super::tracker::{ConfigRefs, Tracker};
use super::{
    canary_namespace, is_initial_phase, owner_reference, CanaryError, Context, Controller,
    TargetMetadata,
};
use crate::cluster::{guard_patch, retry_on_conflict, Cluster, ClusterResource};
use crate::crd::autoscaling::HorizontalPodAutoscalerV2beta2;
use crate::crd::canary::{AutoscalerReference, Canary, CanaryStatus};
use crate::crd::keda::ScaledObject;
use async_trait::async_trait;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use tracing::{debug, info};

/// A workload kind with a pod template that can be mirrored into a primary
pub trait PodWorkload: ClusterResource {
    fn selector(&self) -> Option<&LabelSelector>;

    fn template(&self) -> Option<&PodTemplateSpec>;

    /// Reason the target cannot be mirrored, if any
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    /// New primary with the target's rollout settings
    fn new_primary(
        &self,
        metadata: ObjectMeta,
        selector: LabelSelector,
        template: PodTemplateSpec,
    ) -> Self;

    /// Copy the target's rollout settings and `template` onto this primary.
    /// Replicas are only copied when `copy_replicas` is set.
    fn promote_from(&mut self, target: &Self, template: PodTemplateSpec, copy_replicas: bool);

    /// Template the primary is built from and the drift fingerprint is
    /// computed over
    fn promotable_template(&self) -> Option<PodTemplateSpec> {
        self.template().cloned()
    }

    /// Desired replica count; `None` for kinds that have none
    fn replicas(&self) -> Option<i32> {
        None
    }
}

/// Readiness and scaling of one pod workload kind
#[async_trait]
pub trait PodKind: Send + Sync {
    async fn primary_readiness(&self, canary: &Canary) -> Result<(), CanaryError>;

    async fn canary_readiness(&self, canary: &Canary) -> Result<(), CanaryError>;

    async fn scale_target(&self, canary: &Canary, replicas: i32) -> Result<(), CanaryError>;

    /// Take all load off the target
    async fn scale_down(&self, canary: &Canary) -> Result<(), CanaryError>;

    /// Give the target load again after [`PodKind::scale_down`]
    async fn scale_up(&self, canary: &Canary) -> Result<(), CanaryError>;

    /// Leave the target as it was before the rollout took it over
    async fn restore(&self, canary: &Canary) -> Result<(), CanaryError>;
}

/// [`Controller`] for a pod workload kind `K`
pub struct PodController<C: Cluster, K> {
    ctx: Context<C>,
    tracker: Box<dyn Tracker>,
    scaler: Option<Box<dyn ScalerReconciler>>,
    status: StatusWriter<C>,
    kind: PhantomData<fn() -> K>,
}

impl<C: Cluster, K: PodWorkload> PodController<C, K> {
    pub fn new(
        ctx: Context<C>,
        tracker: Box<dyn Tracker>,
        scaler: Option<Box<dyn ScalerReconciler>>,
    ) -> Self {
        Self {
            status: StatusWriter::new(ctx.clone()),
            ctx,
            tracker,
            scaler,
            kind: PhantomData,
        }
    }

    fn kind() -> String {
        K::kind(&()).to_string()
    }

    async fn target(&self, canary: &Canary) -> Result<K, CanaryError> {
        let namespace = canary_namespace(canary)?;
        Ok(self
            .ctx
            .cluster
            .get(&namespace, &canary.spec.target_ref.name)
            .await?)
    }

    async fn primary(&self, canary: &Canary) -> Result<K, CanaryError> {
        let namespace = canary_namespace(canary)?;
        Ok(self
            .ctx
            .cluster
            .get(&namespace, &primary_name(&canary.spec.target_ref.name))
            .await?)
    }

    /// Selector label key and value of `object`
    fn selector_label(&self, object: &K) -> Result<(String, String), CanaryError> {
        let candidates = &self.ctx.config.selector_labels;
        selector_label(object.selector(), candidates).ok_or_else(|| CanaryError::SelectorLabel {
            kind: Self::kind(),
            namespace: object.namespace().unwrap_or_default(),
            name: object.name_any(),
            candidates: candidates.clone(),
        })
    }

    /// Target pod template rewritten for the primary
    fn primary_template(
        &self,
        target: &K,
        label: &str,
        value: &str,
        refs: &ConfigRefs,
    ) -> Result<PodTemplateSpec, CanaryError> {
        let template = target.promotable_template().unwrap_or_default();
        let meta = template.metadata.unwrap_or_default();

        let mut spec = self
            .tracker
            .apply_primary_configs(template.spec.unwrap_or_default(), refs)?;
        retarget_pod_selectors(&mut spec, &self.ctx.config.selector_labels, value);

        Ok(PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(make_primary_labels(
                    meta.labels.as_ref(),
                    label,
                    &primary_name(value),
                )),
                annotations: Some(make_annotations(meta.annotations.as_ref())),
                ..Default::default()
            }),
            spec: Some(spec),
        })
    }

    /// Labels of the primary object: the included target labels with the
    /// selector label pointing at the primary
    fn primary_labels(&self, target: &K, label: &str, value: &str) -> BTreeMap<String, String> {
        let included = include_labels_by_prefix(
            Some(target.labels()),
            &self.ctx.config.include_label_prefix,
        );
        make_primary_labels(Some(&included), label, &primary_name(value))
    }

    /// Create the primary from the target unless it already exists
    async fn create_primary(&self, canary: &Canary) -> Result<(), CanaryError> {
        let namespace = canary_namespace(canary)?;
        let target = self.target(canary).await?;
        target.validate().map_err(|reason| {
            CanaryError::invalid_target(&Self::kind(), &namespace, &target.name_any(), reason)
        })?;
        let (label, value) = self.selector_label(&target)?;

        let name = primary_name(&canary.spec.target_ref.name);
        if self.ctx.cluster.get_opt::<K>(&namespace, &name).await?.is_some() {
            debug!(canary = %canary.name_any(), namespace = %namespace, primary = %name, "Primary exists");
            return Ok(());
        }

        let scan = self.tracker.get_target_configs(canary).await?;
        self.tracker.create_primary_configs(canary, &scan.refs).await?;

        let metadata = ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.clone()),
            labels: Some(self.primary_labels(&target, &label, &value)),
            annotations: Some(filter_metadata(Some(target.annotations()))),
            owner_references: Some(vec![owner_reference(canary)?]),
            ..Default::default()
        };
        let selector = LabelSelector {
            match_labels: Some(BTreeMap::from([(label.clone(), primary_name(&value))])),
            ..Default::default()
        };
        let template = self.primary_template(&target, &label, &value, &scan.refs)?;

        let primary = target.new_primary(metadata, selector, template);
        self.ctx.cluster.create(&namespace, &primary).await?;
        info!(
            canary = %canary.name_any(),
            namespace = %namespace,
            kind = %Self::kind(),
            primary = %name,
            "Primary created"
        );
        Ok(())
    }

    /// Copy the target onto the primary, retried on conflict
    async fn promote_primary(&self, canary: &Canary) -> Result<(), CanaryError> {
        let namespace = canary_namespace(canary)?;
        let target_name = canary.spec.target_ref.name.as_str();
        let name = primary_name(target_name);
        let copy_replicas = canary.spec.autoscaler_ref.is_none();

        let cluster = &self.ctx.cluster;
        let (ns, primary) = (namespace.as_str(), name.as_str());
        retry_on_conflict(self.ctx.backoff, move || async move {
            let target: K = cluster.get(ns, target_name).await?;
            let (label, value) = self.selector_label(&target)?;
            let mut current: K = cluster.get(ns, primary).await?;

            let scan = self.tracker.get_target_configs(canary).await?;
            self.tracker.create_primary_configs(canary, &scan.refs).await?;
            let template = self.primary_template(&target, &label, &value, &scan.refs)?;

            current.promote_from(&target, template, copy_replicas);
            let labels = self.primary_labels(&target, &label, &value);
            let annotations = include_labels_by_prefix(
                Some(target.annotations()),
                &self.ctx.config.include_label_prefix,
            );
            let meta = current.meta_mut();
            meta.labels = Some(labels);
            meta.annotations = Some(annotations);

            cluster.replace(ns, &current).await?;
            Ok::<_, CanaryError>(())
        })
        .await?;

        info!(
            canary = %canary.name_any(),
            namespace = %namespace,
            kind = %Self::kind(),
            primary = %name,
            "Primary promoted"
        );
        Ok(())
    }

    fn fingerprint(target: &K) -> Result<String, CanaryError> {
        compute_hash(&target.promotable_template())
    }

    async fn reconcile_scaler(&self, canary: &Canary, init: bool) -> Result<(), CanaryError> {
        match &self.scaler {
            Some(scaler) => scaler.reconcile_primary_scaler(canary, init).await,
            None => Ok(()),
        }
    }

    async fn pause_scaler(&self, canary: &Canary) -> Result<(), CanaryError> {
        match &self.scaler {
            Some(scaler) => scaler.pause_target_scaler(canary).await,
            None => Ok(()),
        }
    }

    async fn resume_scaler(&self, canary: &Canary) -> Result<(), CanaryError> {
        match &self.scaler {
            Some(scaler) => scaler.resume_target_scaler(canary).await,
            None => Ok(()),
        }
    }

    /// Merge-patch the target with what `build` derives from its current
    /// state; `None` means there is nothing to change
    async fn patch_target<F>(&self, canary: &Canary, build: F) -> Result<bool, CanaryError>
    where
        F: Fn(&K) -> Option<Value> + Send + Sync,
    {
        let namespace = canary_namespace(canary)?;
        let name = canary.spec.target_ref.name.as_str();
        let cluster = &self.ctx.cluster;
        let (ns, build) = (namespace.as_str(), &build);

        retry_on_conflict(self.ctx.backoff, move || async move {
            let target: K = cluster.get(ns, name).await?;
            let Some(patch) = build(&target) else {
                return Ok(false);
            };
            let patch = guard_patch(patch, target.resource_version().as_deref());
            cluster.patch::<K>(ns, name, &patch).await?;
            Ok::<_, CanaryError>(true)
        })
        .await
    }

    /// Set `spec.replicas` on the target
    async fn set_target_replicas(&self, canary: &Canary, replicas: i32) -> Result<(), CanaryError> {
        let changed = self
            .patch_target(canary, |target| {
                (target.replicas() != Some(replicas))
                    .then(|| json!({ "spec": { "replicas": replicas } }))
            })
            .await?;
        if changed {
            info!(
                canary = %canary.name_any(),
                namespace = ?canary.namespace(),
                kind = %Self::kind(),
                replicas,
                "Target scaled"
            );
        }
        Ok(())
    }

    /// Replica count the target goes back to after being scaled to zero
    ///
    /// The target's own count when it has one; without an autoscaler the
    /// primary's count; otherwise the autoscaler's minimum when above one.
    async fn replicas_from_zero(&self, canary: &Canary, target: &K) -> Result<i32, CanaryError> {
        if let Some(replicas) = target.replicas().filter(|r| *r > 0) {
            return Ok(replicas);
        }
        let replicas = match &canary.spec.autoscaler_ref {
            None => self.primary(canary).await?.replicas(),
            Some(autoscaler) => {
                let namespace = canary_namespace(canary)?;
                autoscaler_min_replicas(&self.ctx.cluster, &namespace, autoscaler)
                    .await
                    .filter(|r| *r > 1)
            }
        };
        Ok(replicas.filter(|r| *r > 0).unwrap_or(1))
    }

    /// Pause the target autoscaler and scale the target to zero replicas
    async fn scale_replicas_down(&self, canary: &Canary) -> Result<(), CanaryError> {
        self.pause_scaler(canary).await?;
        self.set_target_replicas(canary, 0).await
    }

    /// Resume the target autoscaler and scale the target back up
    async fn scale_replicas_up(&self, canary: &Canary) -> Result<(), CanaryError> {
        self.resume_scaler(canary).await?;
        let target = self.target(canary).await?;
        let replicas = self.replicas_from_zero(canary, &target).await?;
        self.set_target_replicas(canary, replicas).await
    }

    /// Scale the target to the primary's replica count, or up from zero
    /// when there is no primary
    async fn restore_replicas(&self, canary: &Canary) -> Result<(), CanaryError> {
        let namespace = canary_namespace(canary)?;
        let name = primary_name(&canary.spec.target_ref.name);
        match self.ctx.cluster.get_opt::<K>(&namespace, &name).await? {
            Some(primary) => {
                self.resume_scaler(canary).await?;
                let replicas = primary.replicas().filter(|r| *r > 0).unwrap_or(1);
                self.set_target_replicas(canary, replicas).await
            }
            None => self.scale_replicas_up(canary).await,
        }
    }
}

/// Minimum replicas of the target's autoscaler; lookup failures yield `None`
async fn autoscaler_min_replicas<C: Cluster>(
    cluster: &C,
    namespace: &str,
    autoscaler: &AutoscalerReference,
) -> Option<i32> {
    let name = autoscaler.name.as_str();
    match autoscaler.kind.as_str() {
        "HorizontalPodAutoscaler" => {
            match cluster.get::<HorizontalPodAutoscaler>(namespace, name).await {
                Ok(hpa) => hpa.spec.and_then(|s| s.min_replicas),
                Err(e) => {
                    debug!(error = %e, hpa = %name, "Falling back to autoscaling/v2beta2");
                    cluster
                        .get::<HorizontalPodAutoscalerV2beta2>(namespace, name)
                        .await
                        .ok()
                        .and_then(|hpa| hpa.spec)
                        .and_then(|s| s.min_replicas)
                }
            }
        }
        "ScaledObject" => cluster
            .get::<ScaledObject>(namespace, name)
            .await
            .ok()
            .and_then(|so| so.spec.min_replica_count),
        _ => None,
    }
}

#[async_trait]
impl<C, K> Controller for PodController<C, K>
where
    C: Cluster,
    K: PodWorkload,
    Self: PodKind,
{
    async fn initialize(&self, canary: &Canary, skip_liveness_checks: bool) -> Result<(), CanaryError> {
        self.create_primary(canary).await?;
        if is_initial_phase(canary) {
            if !skip_liveness_checks && !canary.spec.skip_analysis {
                self.primary_readiness(canary).await?;
            }
            self.scale_down(canary).await?;
        }
        self.reconcile_scaler(canary, true).await
    }

    async fn promote(&self, canary: &Canary) -> Result<(), CanaryError> {
        self.promote_primary(canary).await?;
        self.reconcile_scaler(canary, false).await
    }

    async fn is_primary_ready(&self, canary: &Canary) -> Result<(), CanaryError> {
        self.primary_readiness(canary).await
    }

    async fn is_canary_ready(&self, canary: &Canary) -> Result<(), CanaryError> {
        self.canary_readiness(canary).await
    }

    async fn has_target_changed(&self, canary: &Canary) -> Result<bool, CanaryError> {
        let target = self.target(canary).await?;
        Ok(has_spec_changed(canary, &Self::fingerprint(&target)?))
    }

    async fn have_dependencies_changed(&self, canary: &Canary) -> Result<bool, CanaryError> {
        self.tracker.has_config_changed(canary).await
    }

    async fn scale(&self, canary: &Canary, replicas: i32) -> Result<(), CanaryError> {
        self.scale_target(canary, replicas).await
    }

    async fn scale_to_zero(&self, canary: &Canary) -> Result<(), CanaryError> {
        self.scale_down(canary).await
    }

    async fn scale_from_zero(&self, canary: &Canary) -> Result<(), CanaryError> {
        self.scale_up(canary).await
    }

    async fn get_metadata(&self, canary: &Canary) -> Result<TargetMetadata, CanaryError> {
        let target = self.target(canary).await?;
        let (label, label_value) = self.selector_label(&target)?;
        let ports = canary.spec.service.port_discovery.then(|| {
            target
                .template()
                .and_then(|t| t.spec.as_ref())
                .map(|spec| discover_ports(spec, &canary.spec.service))
                .unwrap_or_default()
        });
        Ok(TargetMetadata {
            label,
            label_value,
            ports,
        })
    }

    async fn sync_status(&self, canary: &Canary, status: CanaryStatus) -> Result<(), CanaryError> {
        let target = self.target(canary).await?;
        let hash = Self::fingerprint(&target)?;
        let configs = self.tracker.get_config_refs(canary).await?;
        self.status.sync(canary, status, hash, Some(configs)).await
    }

    async fn finalize(&self, canary: &Canary) -> Result<(), CanaryError> {
        self.restore(canary).await
    }

    fn status_store(&self) -> &dyn StatusStore {
        &self.status
    }
}
