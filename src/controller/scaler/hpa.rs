use super::{
    autoscaler_ref, override_replicas, primary_scaler_meta, propagated_meta,
    upsert_primary_scaler, ScalerReconciler,
};
use crate::cluster::{Cluster, ClusterResource};
use crate::controller::metadata::primary_name;
use crate::controller::{canary_namespace, CanaryError, Context};
use crate::crd::autoscaling::HorizontalPodAutoscalerV2beta2;
use crate::crd::canary::Canary;
use async_trait::async_trait;
use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
};
use kube::api::ObjectMeta;
use tracing::debug;

/// `autoscaling/v2` and `autoscaling/v2beta2` HorizontalPodAutoscalers
trait HpaObject: ClusterResource {
    fn from_parts(metadata: ObjectMeta, spec: HorizontalPodAutoscalerSpec) -> Self;
    fn hpa_spec(&self) -> Option<&HorizontalPodAutoscalerSpec>;
    fn hpa_spec_mut(&mut self) -> &mut Option<HorizontalPodAutoscalerSpec>;
}

impl HpaObject for HorizontalPodAutoscaler {
    fn from_parts(metadata: ObjectMeta, spec: HorizontalPodAutoscalerSpec) -> Self {
        HorizontalPodAutoscaler {
            metadata,
            spec: Some(spec),
            ..Default::default()
        }
    }

    fn hpa_spec(&self) -> Option<&HorizontalPodAutoscalerSpec> {
        self.spec.as_ref()
    }

    fn hpa_spec_mut(&mut self) -> &mut Option<HorizontalPodAutoscalerSpec> {
        &mut self.spec
    }
}

impl HpaObject for HorizontalPodAutoscalerV2beta2 {
    fn from_parts(metadata: ObjectMeta, spec: HorizontalPodAutoscalerSpec) -> Self {
        HorizontalPodAutoscalerV2beta2::new(metadata, spec)
    }

    fn hpa_spec(&self) -> Option<&HorizontalPodAutoscalerSpec> {
        self.spec.as_ref()
    }

    fn hpa_spec_mut(&mut self) -> &mut Option<HorizontalPodAutoscalerSpec> {
        &mut self.spec
    }
}

/// Mirrors a HorizontalPodAutoscaler onto the primary
///
/// `autoscaling/v2` is tried first; clusters that do not serve it fall back
/// to `autoscaling/v2beta2`.
pub struct HpaReconciler<C: Cluster> {
    ctx: Context<C>,
}

impl<C: Cluster> HpaReconciler<C> {
    pub fn new(ctx: Context<C>) -> Self {
        Self { ctx }
    }

    async fn reconcile<H: HpaObject>(
        &self,
        canary: &Canary,
        target: H,
        init: bool,
    ) -> Result<(), CanaryError> {
        let namespace = canary_namespace(canary)?;
        let autoscaler = autoscaler_ref(canary)?;
        let target_spec = target.hpa_spec().ok_or_else(|| {
            CanaryError::invalid_target(
                "HorizontalPodAutoscaler",
                &namespace,
                &autoscaler.name,
                "autoscaler has no spec",
            )
        })?;

        let desired = primary_hpa_spec(canary, target_spec);
        let (labels, annotations) =
            propagated_meta(target.meta(), &self.ctx.config.include_label_prefix);

        upsert_primary_scaler::<C, H, _, _, _>(
            &self.ctx,
            canary,
            init,
            || {
                let meta = primary_scaler_meta(
                    canary,
                    primary_name(&autoscaler.name),
                    Some(&labels),
                    Some(&annotations),
                )?;
                Ok(H::from_parts(meta, desired.clone()))
            },
            |primary| {
                primary.hpa_spec().map_or(true, |spec| hpa_changed(spec, &desired))
                    || primary.meta().labels.clone().unwrap_or_default() != labels
                    || primary.meta().annotations.clone().unwrap_or_default() != annotations
            },
            |primary| {
                let spec = primary.hpa_spec_mut().get_or_insert_with(|| desired.clone());
                spec.min_replicas = desired.min_replicas;
                spec.max_replicas = desired.max_replicas;
                spec.metrics = desired.metrics.clone();
                spec.behavior = desired.behavior.clone();
                primary.meta_mut().labels = Some(labels.clone());
                primary.meta_mut().annotations = Some(annotations.clone());
            },
        )
        .await
    }
}

#[async_trait]
impl<C: Cluster> ScalerReconciler for HpaReconciler<C> {
    async fn reconcile_primary_scaler(&self, canary: &Canary, init: bool) -> Result<(), CanaryError> {
        let namespace = canary_namespace(canary)?;
        let name = &autoscaler_ref(canary)?.name;

        match self.ctx.cluster.get::<HorizontalPodAutoscaler>(&namespace, name).await {
            Ok(target) => self.reconcile(canary, target, init).await,
            Err(e) if e.is_not_found() => {
                debug!(
                    hpa = %name,
                    namespace = %namespace,
                    "HorizontalPodAutoscaler v2 not found, falling back to v2beta2"
                );
                let target: HorizontalPodAutoscalerV2beta2 =
                    self.ctx.cluster.get(&namespace, name).await?;
                self.reconcile(canary, target, init).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn pause_target_scaler(&self, _canary: &Canary) -> Result<(), CanaryError> {
        Ok(())
    }

    async fn resume_target_scaler(&self, _canary: &Canary) -> Result<(), CanaryError> {
        Ok(())
    }
}

/// Target HPA spec pointed at the primary, with replica overrides applied
fn primary_hpa_spec(canary: &Canary, target: &HorizontalPodAutoscalerSpec) -> HorizontalPodAutoscalerSpec {
    let mut spec = HorizontalPodAutoscalerSpec {
        scale_target_ref: CrossVersionObjectReference {
            name: primary_name(&canary.spec.target_ref.name),
            kind: target.scale_target_ref.kind.clone(),
            api_version: target.scale_target_ref.api_version.clone(),
        },
        min_replicas: target.min_replicas,
        max_replicas: target.max_replicas,
        metrics: target.metrics.clone(),
        behavior: target.behavior.clone(),
    };

    let overrides = canary
        .spec
        .autoscaler_ref
        .as_ref()
        .and_then(|a| a.primary_scaler_replicas.as_ref());
    let mut max = Some(spec.max_replicas);
    override_replicas(&mut spec.min_replicas, &mut max, overrides);
    spec.max_replicas = max.unwrap_or(spec.max_replicas);
    spec
}

/// Whether the fields mirrored from the target differ; an unset minimum counts as 1
fn hpa_changed(primary: &HorizontalPodAutoscalerSpec, desired: &HorizontalPodAutoscalerSpec) -> bool {
    primary.metrics != desired.metrics
        || primary.behavior != desired.behavior
        || primary.min_replicas.unwrap_or(1) != desired.min_replicas.unwrap_or(1)
        || primary.max_replicas != desired.max_replicas
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "hpa_test.rs"]
mod tests;
