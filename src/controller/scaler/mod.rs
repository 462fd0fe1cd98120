//! Autoscalers mirrored onto the primary
//!
//! A target scaled by an HPA or a KEDA object gets a `{autoscaler}-primary`
//! copy pointing at `{target}-primary`. The copy is created during
//! initialization and kept in sync on promotion.

pub mod hpa;
pub mod http_scaled_object;
pub mod scaled_object;

pub use hpa::HpaReconciler;
pub use http_scaled_object::HttpScaledObjectReconciler;
pub use scaled_object::ScaledObjectReconciler;

use super::metadata::{filter_metadata, include_labels_by_prefix, primary_name};
use super::{canary_namespace, owner_reference, CanaryError, Context};
use crate::cluster::{retry_on_conflict, Cluster, ClusterResource};
use crate::crd::canary::{AutoscalerReference, Canary, ScalerReplicas};
use async_trait::async_trait;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use tracing::info;

#[async_trait]
pub trait ScalerReconciler: Send + Sync {
    /// Create the primary autoscaler if absent; unless `init`, bring an
    /// existing one in line with the target's
    async fn reconcile_primary_scaler(&self, canary: &Canary, init: bool) -> Result<(), CanaryError>;

    /// Stop the target's autoscaler from scaling the target back up
    async fn pause_target_scaler(&self, canary: &Canary) -> Result<(), CanaryError>;

    async fn resume_target_scaler(&self, canary: &Canary) -> Result<(), CanaryError>;
}

/// Reconciler for the Canary's autoscaler kind, `None` when there is none
/// or the kind is not supported
pub fn for_canary<C: Cluster>(ctx: &Context<C>, canary: &Canary) -> Option<Box<dyn ScalerReconciler>> {
    let autoscaler = canary.spec.autoscaler_ref.as_ref()?;
    match autoscaler.kind.as_str() {
        "HorizontalPodAutoscaler" => Some(Box::new(HpaReconciler::new(ctx.clone()))),
        "ScaledObject" => Some(Box::new(ScaledObjectReconciler::new(ctx.clone()))),
        "HTTPScaledObject" => Some(Box::new(HttpScaledObjectReconciler::new(ctx.clone()))),
        _ => None,
    }
}

pub(crate) fn autoscaler_ref(canary: &Canary) -> Result<&AutoscalerReference, CanaryError> {
    canary
        .spec
        .autoscaler_ref
        .as_ref()
        .ok_or_else(|| CanaryError::MissingField("spec.autoscalerRef".to_string()))
}

/// Metadata of a new primary autoscaler
pub(crate) fn primary_scaler_meta(
    canary: &Canary,
    name: String,
    labels: Option<&BTreeMap<String, String>>,
    annotations: Option<&BTreeMap<String, String>>,
) -> Result<ObjectMeta, CanaryError> {
    Ok(ObjectMeta {
        name: Some(name),
        namespace: Some(canary_namespace(canary)?),
        labels: Some(filter_metadata(labels)),
        annotations: annotations.map(|a| filter_metadata(Some(a))),
        owner_references: Some(vec![owner_reference(canary)?]),
        ..Default::default()
    })
}

/// Apply `primaryScalerReplicas` bounds
pub(crate) fn override_replicas(
    min: &mut Option<i32>,
    max: &mut Option<i32>,
    replicas: Option<&ScalerReplicas>,
) {
    let Some(replicas) = replicas else {
        return;
    };
    if let Some(value) = replicas.min_replicas {
        *min = Some(value);
    }
    if let Some(value) = replicas.max_replicas {
        *max = Some(value);
    }
}

/// Create the primary autoscaler if absent; otherwise, unless `init`,
/// rewrite it when it drifted
///
/// `build` makes a new object from metadata; `changed` compares the stored
/// primary with the desired state and `apply` writes the desired state into
/// a freshly read primary.
pub(crate) async fn upsert_primary_scaler<C, K, B, D, A>(
    ctx: &Context<C>,
    canary: &Canary,
    init: bool,
    build: B,
    changed: D,
    apply: A,
) -> Result<(), CanaryError>
where
    C: Cluster,
    K: ClusterResource,
    B: FnOnce() -> Result<K, CanaryError> + Send,
    D: Fn(&K) -> bool + Send,
    A: Fn(&mut K) + Send + Sync,
{
    let namespace = canary_namespace(canary)?;
    let name = primary_name(&autoscaler_ref(canary)?.name);
    let kind = K::kind(&());

    let Some(primary) = ctx.cluster.get_opt::<K>(&namespace, &name).await? else {
        ctx.cluster.create(&namespace, &build()?).await?;
        info!(
            canary = ?canary.metadata.name,
            namespace = %namespace,
            name = %name,
            kind = %kind,
            "Primary autoscaler created"
        );
        return Ok(());
    };

    if init || !changed(&primary) {
        return Ok(());
    }

    let cluster = &ctx.cluster;
    let (namespace, name, apply) = (namespace.as_str(), name.as_str(), &apply);
    retry_on_conflict(ctx.backoff, move || async move {
        let mut primary: K = cluster.get(namespace, name).await?;
        apply(&mut primary);
        cluster.replace(namespace, &primary).await?;
        Ok::<_, CanaryError>(())
    })
    .await?;
    info!(
        canary = ?canary.metadata.name,
        namespace = %namespace,
        name = %name,
        kind = %kind,
        "Primary autoscaler updated"
    );
    Ok(())
}

/// Labels and annotations of the target autoscaler carried onto the primary
///
/// Labels are copied minus toolkit keys; annotations only when their key
/// matches an include prefix.
pub(crate) fn propagated_meta(
    target: &ObjectMeta,
    include_label_prefix: &[String],
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    (
        filter_metadata(target.labels.as_ref()),
        include_labels_by_prefix(target.annotations.as_ref(), include_label_prefix),
    )
}
