//! Knative Services
//!
//! Knative keeps every revision around, so there is no primary object. The
//! primary is the revision named by [`PRIMARY_REVISION_ANNOTATION`] on the
//! Service, and traffic is split between it and the latest revision.

use crate::cluster::{guard_patch, retry_on_conflict, Cluster};
use crate::controller::spec::{compute_hash, has_spec_changed};
use crate::controller::status::{StatusStore, StatusWriter};
use crate::controller::{
    canary_namespace, is_initial_phase, CanaryError, Context, Controller, TargetMetadata,
};
use crate::crd::canary::{Canary, CanaryStatus};
use crate::crd::knative::{Revision, Service as KnativeService};
use async_trait::async_trait;
use kube::ResourceExt;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::info;

/// Service annotation naming the revision that serves primary traffic
pub const PRIMARY_REVISION_ANNOTATION: &str = "kanari.io/primary-revision";

pub struct KnativeController<C: Cluster> {
    ctx: Context<C>,
    status: StatusWriter<C>,
}

impl<C: Cluster> KnativeController<C> {
    pub fn new(ctx: Context<C>) -> Self {
        Self {
            status: StatusWriter::new(ctx.clone()),
            ctx,
        }
    }

    async fn service(&self, canary: &Canary) -> Result<KnativeService, CanaryError> {
        let namespace = canary_namespace(canary)?;
        Ok(self
            .ctx
            .cluster
            .get(&namespace, &canary.spec.target_ref.name)
            .await?)
    }

    /// Merge-patch the target Service with what `build` derives from its
    /// latest created revision
    async fn patch_service<F>(&self, canary: &Canary, build: F) -> Result<(), CanaryError>
    where
        F: Fn(String) -> Value + Send + Sync,
    {
        let namespace = canary_namespace(canary)?;
        let cluster = &self.ctx.cluster;
        let (ns, name, build) = (
            namespace.as_str(),
            canary.spec.target_ref.name.as_str(),
            &build,
        );

        retry_on_conflict(self.ctx.backoff, move || async move {
            let service = self.service(canary).await?;
            let latest = latest_created_revision(&service)?;
            let patch = guard_patch(build(latest), service.metadata.resource_version.as_deref());
            cluster.patch::<KnativeService>(ns, name, &patch).await?;
            Ok::<_, CanaryError>(())
        })
        .await
    }

    async fn revision_ready(&self, canary: &Canary, name: &str) -> Result<(), CanaryError> {
        let namespace = canary_namespace(canary)?;
        let revision: Revision = self.ctx.cluster.get(&namespace, name).await?;
        if revision.is_ready() {
            return Ok(());
        }
        Err(CanaryError::not_ready(
            "Revision",
            &namespace,
            name,
            "revision is not ready",
            true,
        ))
    }
}

fn latest_created_revision(service: &KnativeService) -> Result<String, CanaryError> {
    service
        .status
        .as_ref()
        .and_then(|s| s.latest_created_revision_name.clone())
        .ok_or_else(|| {
            CanaryError::not_ready(
                "Service",
                &service.namespace().unwrap_or_default(),
                &service.name_any(),
                "no revision created yet",
                true,
            )
        })
}

/// Merge patch naming `revision` as the primary one
fn primary_revision_patch(revision: &str) -> Value {
    let mut annotations = Map::new();
    annotations.insert(
        PRIMARY_REVISION_ANNOTATION.to_string(),
        Value::from(revision),
    );
    json!({ "metadata": { "annotations": annotations } })
}

#[async_trait]
impl<C: Cluster> Controller for KnativeController<C> {
    /// Pin all traffic to the current revision while leaving the latest
    /// revision addressable at 0%
    async fn initialize(&self, canary: &Canary, _skip_liveness_checks: bool) -> Result<(), CanaryError> {
        if !is_initial_phase(canary) {
            return Ok(());
        }
        self.patch_service(canary, |latest| {
            let mut patch = primary_revision_patch(&latest);
            patch["spec"] = json!({
                "traffic": [
                    { "latestRevision": true, "percent": 0 },
                    { "revisionName": latest, "percent": 100 }
                ]
            });
            patch
        })
        .await?;
        info!(canary = %canary.name_any(), namespace = ?canary.namespace(), "Knative Service traffic pinned to primary revision");
        Ok(())
    }

    async fn promote(&self, canary: &Canary) -> Result<(), CanaryError> {
        self.patch_service(canary, |latest| primary_revision_patch(&latest))
            .await?;
        info!(canary = %canary.name_any(), namespace = ?canary.namespace(), "Primary revision promoted");
        Ok(())
    }

    async fn is_primary_ready(&self, canary: &Canary) -> Result<(), CanaryError> {
        let service = self.service(canary).await?;
        let Some(revision) = service.annotations().get(PRIMARY_REVISION_ANNOTATION) else {
            return Err(CanaryError::not_ready(
                "Service",
                &canary_namespace(canary)?,
                &service.name_any(),
                "primary revision annotation not found",
                true,
            ));
        };
        self.revision_ready(canary, revision).await
    }

    async fn is_canary_ready(&self, canary: &Canary) -> Result<(), CanaryError> {
        let service = self.service(canary).await?;
        let latest = latest_created_revision(&service)?;
        self.revision_ready(canary, &latest).await
    }

    async fn has_target_changed(&self, canary: &Canary) -> Result<bool, CanaryError> {
        let service = self.service(canary).await?;
        let latest = latest_created_revision(&service)?;
        Ok(has_spec_changed(canary, &compute_hash(&latest)?))
    }

    async fn have_dependencies_changed(&self, _canary: &Canary) -> Result<bool, CanaryError> {
        Ok(false)
    }

    async fn scale(&self, _canary: &Canary, _replicas: i32) -> Result<(), CanaryError> {
        Ok(())
    }

    async fn scale_to_zero(&self, _canary: &Canary) -> Result<(), CanaryError> {
        Ok(())
    }

    async fn scale_from_zero(&self, _canary: &Canary) -> Result<(), CanaryError> {
        Ok(())
    }

    async fn get_metadata(&self, _canary: &Canary) -> Result<TargetMetadata, CanaryError> {
        Ok(TargetMetadata {
            ports: Some(BTreeMap::new()),
            ..Default::default()
        })
    }

    async fn sync_status(&self, canary: &Canary, status: CanaryStatus) -> Result<(), CanaryError> {
        let service = self.service(canary).await?;
        let hash = compute_hash(&latest_created_revision(&service)?)?;
        self.status.sync(canary, status, hash, None).await
    }

    async fn finalize(&self, _canary: &Canary) -> Result<(), CanaryError> {
        Ok(())
    }

    fn status_store(&self) -> &dyn StatusStore {
        &self.status
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "knative_test.rs"]
mod tests;
