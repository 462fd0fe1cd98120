use super::{autoscaler_ref, override_replicas, primary_scaler_meta, upsert_primary_scaler, ScalerReconciler};
use crate::cluster::Cluster;
use crate::controller::metadata::primary_name;
use crate::controller::{canary_namespace, CanaryError, Context};
use crate::crd::canary::Canary;
use crate::crd::keda::{HTTPScaleTarget, HTTPScaledObject, HTTPScaledObjectSpec, HTTPScalingSet};
use async_trait::async_trait;

/// Mirrors a KEDA HTTPScaledObject onto the primary
pub struct HttpScaledObjectReconciler<C: Cluster> {
    ctx: Context<C>,
}

impl<C: Cluster> HttpScaledObjectReconciler<C> {
    pub fn new(ctx: Context<C>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl<C: Cluster> ScalerReconciler for HttpScaledObjectReconciler<C> {
    async fn reconcile_primary_scaler(&self, canary: &Canary, init: bool) -> Result<(), CanaryError> {
        let namespace = canary_namespace(canary)?;
        let autoscaler = autoscaler_ref(canary)?;
        let target: HTTPScaledObject = self.ctx.cluster.get(&namespace, &autoscaler.name).await?;
        let desired = primary_http_scaled_object_spec(canary, &target.spec);

        upsert_primary_scaler::<C, HTTPScaledObject, _, _, _>(
            &self.ctx,
            canary,
            init,
            || {
                let name = primary_name(&autoscaler.name);
                let mut primary = HTTPScaledObject::new(&name, desired.clone());
                primary.metadata =
                    primary_scaler_meta(canary, name, target.metadata.labels.as_ref(), None)?;
                Ok(primary)
            },
            |primary| primary.spec != desired,
            |primary| primary.spec = desired.clone(),
        )
        .await
    }

    async fn pause_target_scaler(&self, _canary: &Canary) -> Result<(), CanaryError> {
        Ok(())
    }

    async fn resume_target_scaler(&self, _canary: &Canary) -> Result<(), CanaryError> {
        Ok(())
    }
}

/// HTTPScaledObject routing to the primary workload and `{service}-primary`
pub fn primary_http_scaled_object_spec(
    canary: &Canary,
    target: &HTTPScaledObjectSpec,
) -> HTTPScaledObjectSpec {
    let autoscaler = canary.spec.autoscaler_ref.as_ref();
    let mut spec = HTTPScaledObjectSpec {
        hosts: target.hosts.clone(),
        path_prefixes: target.path_prefixes.clone(),
        scale_target_ref: HTTPScaleTarget {
            name: primary_name(&canary.spec.target_ref.name),
            kind: target.scale_target_ref.kind.clone(),
            api_version: target.scale_target_ref.api_version.clone(),
            service: primary_name(&target.scale_target_ref.service),
            port: target.scale_target_ref.port,
        },
        replicas: target.replicas.clone(),
        target_pending_requests: target.target_pending_requests,
        scaledown_period: target.scaledown_period,
        scaling_metric: target.scaling_metric.clone(),
        scaling_set: autoscaler
            .and_then(|a| a.primary_scaling_set.as_ref())
            .map(|set| HTTPScalingSet {
                name: set.name.clone(),
                kind: set.kind.clone(),
            }),
    };

    if let Some(overrides) = autoscaler.and_then(|a| a.primary_scaler_replicas.as_ref()) {
        let replicas = spec.replicas.get_or_insert_with(Default::default);
        override_replicas(&mut replicas.min, &mut replicas.max, Some(overrides));
    }
    spec
}
