use super::{
    autoscaler_ref, override_replicas, primary_scaler_meta, upsert_primary_scaler,
    ScalerReconciler,
};
use crate::cluster::{guard_patch, retry_on_conflict, Cluster};
use crate::controller::metadata::{canary_name, filter_metadata, primary_name};
use crate::controller::{canary_namespace, CanaryError, Context};
use crate::crd::canary::Canary;
use crate::crd::keda::{ScaleTrigger, ScaledObject, ScaledObjectSpec, PAUSED_REPLICAS_ANNOTATION};
use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Map, Value};
use tracing::info;

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Mirrors a KEDA ScaledObject onto the primary and pauses the target's
pub struct ScaledObjectReconciler<C: Cluster> {
    ctx: Context<C>,
}

impl<C: Cluster> ScaledObjectReconciler<C> {
    pub fn new(ctx: Context<C>) -> Self {
        Self { ctx }
    }

    /// Set the paused-replicas annotation on the target ScaledObject; `null` removes it
    async fn set_paused_replicas(&self, canary: &Canary, value: Value) -> Result<(), CanaryError> {
        let namespace = canary_namespace(canary)?;
        let name = autoscaler_ref(canary)?.name.as_str();
        let cluster = &self.ctx.cluster;
        let mut annotations = Map::new();
        annotations.insert(PAUSED_REPLICAS_ANNOTATION.to_string(), value);
        let (ns, annotations) = (namespace.as_str(), &annotations);

        retry_on_conflict(self.ctx.backoff, move || async move {
            let target: ScaledObject = cluster.get(ns, name).await?;
            let patch = guard_patch(
                json!({ "metadata": { "annotations": annotations } }),
                target.metadata.resource_version.as_deref(),
            );
            cluster.patch::<ScaledObject>(ns, name, &patch).await?;
            Ok::<_, CanaryError>(())
        })
        .await
    }
}

#[async_trait]
impl<C: Cluster> ScalerReconciler for ScaledObjectReconciler<C> {
    async fn reconcile_primary_scaler(&self, canary: &Canary, init: bool) -> Result<(), CanaryError> {
        let namespace = canary_namespace(canary)?;
        let autoscaler = autoscaler_ref(canary)?;
        let target: ScaledObject = self.ctx.cluster.get(&namespace, &autoscaler.name).await?;
        let desired = primary_scaled_object_spec(canary, &target.spec);
        // Annotations are carried over so KEDA's HPA ownership transfer applies to the primary
        let labels = filter_metadata(target.metadata.labels.as_ref());
        let mut annotations = filter_metadata(target.metadata.annotations.as_ref());
        annotations.remove(PAUSED_REPLICAS_ANNOTATION);

        upsert_primary_scaler::<C, ScaledObject, _, _, _>(
            &self.ctx,
            canary,
            init,
            || {
                let metadata = primary_scaler_meta(
                    canary,
                    primary_name(&autoscaler.name),
                    Some(&labels),
                    Some(&annotations),
                )?;
                Ok(ScaledObject {
                    metadata,
                    spec: desired.clone(),
                    status: None,
                })
            },
            |primary| {
                primary.spec != desired
                    || primary.metadata.labels.clone().unwrap_or_default() != labels
                    || primary.metadata.annotations.clone().unwrap_or_default() != annotations
            },
            |primary| {
                primary.spec = desired.clone();
                primary.metadata.labels = Some(labels.clone());
                primary.metadata.annotations = Some(annotations.clone());
            },
        )
        .await
    }

    async fn pause_target_scaler(&self, canary: &Canary) -> Result<(), CanaryError> {
        self.set_paused_replicas(canary, Value::from("0")).await?;
        info!(canary = ?canary.metadata.name, "Target ScaledObject paused");
        Ok(())
    }

    async fn resume_target_scaler(&self, canary: &Canary) -> Result<(), CanaryError> {
        self.set_paused_replicas(canary, Value::Null).await?;
        info!(canary = ?canary.metadata.name, "Target ScaledObject resumed");
        Ok(())
    }
}

/// Target ScaledObject spec retargeted at the primary
///
/// Trigger queries are rewritten, a custom HPA name gets the primary
/// suffix, and replica overrides are applied.
pub fn primary_scaled_object_spec(canary: &Canary, target: &ScaledObjectSpec) -> ScaledObjectSpec {
    let mut spec = target.clone();
    spec.scale_target_ref.name = primary_name(&canary.spec.target_ref.name);
    set_primary_queries(canary, &mut spec.triggers);

    if let Some(name) = spec
        .advanced
        .as_mut()
        .and_then(|a| a.horizontal_pod_autoscaler_config.as_mut())
        .and_then(|c| c.name.as_mut())
        .filter(|n| !n.is_empty())
    {
        *name = primary_name(name);
    }

    let overrides = canary
        .spec
        .autoscaler_ref
        .as_ref()
        .and_then(|a| a.primary_scaler_replicas.as_ref());
    override_replicas(&mut spec.min_replica_count, &mut spec.max_replica_count, overrides);
    spec
}

/// Point trigger `query` metadata at the primary
///
/// With `primaryScalerQueries` set, the query of each named trigger is
/// replaced outright. Otherwise both `{target}` and `{target}-canary` are
/// renamed to `{target}-primary` in the existing query.
pub fn set_primary_queries(canary: &Canary, triggers: &mut [ScaleTrigger]) {
    let queries = canary
        .spec
        .autoscaler_ref
        .as_ref()
        .and_then(|a| a.primary_scaler_queries.as_ref());
    let target = &canary.spec.target_ref.name;

    for trigger in triggers {
        match queries {
            Some(queries) => {
                if let Some(query) = trigger.name.as_ref().and_then(|n| queries.get(n)) {
                    trigger.metadata.insert("query".to_string(), query.clone());
                }
            }
            None => {
                if let Some(query) = trigger.metadata.get_mut("query") {
                    *query = primary_query(query, target);
                }
            }
        }
    }
}

/// Rename `{target}-canary` and `{target}` to `{target}-primary`
///
/// The canary name is swapped for a random placeholder first so it does not
/// become `{target}-primary-canary`.
pub fn primary_query(query: &str, target: &str) -> String {
    let placeholder = placeholder();
    let primary = primary_name(target);
    query
        .replace(&canary_name(target), &placeholder)
        .replace(target, &primary)
        .replace(&placeholder, &primary)
}

fn placeholder() -> String {
    let mut rng = rand::thread_rng();
    (0..10)
        .map(|_| LETTERS[rng.gen_range(0..LETTERS.len())] as char)
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "scaled_object_test.rs"]
mod tests;
