//! Plain Services
//!
//! Without a pod template there is nothing to mirror but the Service
//! itself: `{name}-canary` follows the target on every initialization and
//! `{name}-primary` is created once, then overwritten on promotion.

use crate::cluster::{retry_on_conflict, Cluster};
use crate::controller::metadata::{canary_name, primary_name};
use crate::controller::spec::{compute_hash, has_spec_changed};
use crate::controller::status::{StatusStore, StatusWriter};
use crate::controller::{
    canary_namespace, owner_reference, CanaryError, Context, Controller, TargetMetadata,
};
use crate::crd::canary::{Canary, CanaryStatus};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tracing::info;

/// Annotation kubectl keeps the last applied manifest in
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

pub struct ServiceController<C: Cluster> {
    ctx: Context<C>,
    status: StatusWriter<C>,
}

impl<C: Cluster> ServiceController<C> {
    pub fn new(ctx: Context<C>) -> Self {
        Self {
            status: StatusWriter::new(ctx.clone()),
            ctx,
        }
    }

    async fn target(&self, canary: &Canary) -> Result<Service, CanaryError> {
        let namespace = canary_namespace(canary)?;
        Ok(self
            .ctx
            .cluster
            .get(&namespace, &canary.spec.target_ref.name)
            .await?)
    }

    /// Create `name` from `source`, or bring it in line with `source` when
    /// it exists and `update` is set
    async fn reconcile_service(
        &self,
        canary: &Canary,
        name: &str,
        source: &Service,
        update: bool,
    ) -> Result<(), CanaryError> {
        let namespace = canary_namespace(canary)?;
        let cluster = &self.ctx.cluster;

        if cluster.get_opt::<Service>(&namespace, name).await?.is_none() {
            let mut service = build_service(canary, name, source)?;
            if is_cluster_ip(&service) {
                if let Some(spec) = service.spec.as_mut() {
                    spec.cluster_ip = None;
                    spec.cluster_ips = None;
                }
            }
            service.metadata.resource_version = None;
            service.metadata.uid = None;
            cluster.create(&namespace, &service).await?;
            info!(canary = %canary.name_any(), namespace = %namespace, service = %name, "Service created");
            return Ok(());
        }
        if !update {
            return Ok(());
        }

        let ns = namespace.as_str();
        retry_on_conflict(self.ctx.backoff, move || async move {
            let current: Service = cluster.get(ns, name).await?;
            let mut service = build_service(canary, name, source)?;
            keep_immutable_fields(&mut service, &current);
            cluster.replace(ns, &service).await?;
            Ok::<_, CanaryError>(())
        })
        .await?;
        info!(canary = %canary.name_any(), namespace = %namespace, service = %name, "Service updated");
        Ok(())
    }
}

/// Copy of `source` named `name` and owned by the Canary
fn build_service(canary: &Canary, name: &str, source: &Service) -> Result<Service, CanaryError> {
    let mut service = source.clone();
    service.metadata.name = Some(name.to_string());
    service.metadata.namespace = Some(canary_namespace(canary)?);
    service.metadata.owner_references = Some(vec![owner_reference(canary)?]);
    if let Some(annotations) = service.metadata.annotations.as_mut() {
        annotations.remove(LAST_APPLIED_ANNOTATION);
    }
    service.status = None;
    Ok(service)
}

fn is_cluster_ip(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .map_or(true, |t| t == "ClusterIP")
}

/// Carry over what the API server does not let an update change
fn keep_immutable_fields(service: &mut Service, current: &Service) {
    if is_cluster_ip(service) {
        let existing = current.spec.clone().unwrap_or_default();
        if let Some(spec) = service.spec.as_mut() {
            spec.cluster_ip = existing.cluster_ip;
            spec.cluster_ips = existing.cluster_ips;
        }
    }
    service.metadata.uid = current.metadata.uid.clone();
    service.metadata.resource_version = current.metadata.resource_version.clone();
}

#[async_trait]
impl<C: Cluster> Controller for ServiceController<C> {
    async fn initialize(&self, canary: &Canary, _skip_liveness_checks: bool) -> Result<(), CanaryError> {
        let target = self.target(canary).await?;
        let name = &canary.spec.target_ref.name;
        self.reconcile_service(canary, &canary_name(name), &target, true)
            .await?;
        self.reconcile_service(canary, &primary_name(name), &target, false)
            .await
    }

    async fn promote(&self, canary: &Canary) -> Result<(), CanaryError> {
        let namespace = canary_namespace(canary)?;
        let name = primary_name(&canary.spec.target_ref.name);
        let cluster = &self.ctx.cluster;
        let (ns, primary) = (namespace.as_str(), name.as_str());

        retry_on_conflict(self.ctx.backoff, move || async move {
            let target = self.target(canary).await?;
            let current: Service = cluster.get(ns, primary).await?;
            let mut service = build_service(canary, primary, &target)?;
            keep_immutable_fields(&mut service, &current);
            cluster.replace(ns, &service).await?;
            Ok::<_, CanaryError>(())
        })
        .await?;
        info!(canary = %canary.name_any(), namespace = %namespace, service = %name, "Primary service promoted");
        Ok(())
    }

    async fn is_primary_ready(&self, _canary: &Canary) -> Result<(), CanaryError> {
        Ok(())
    }

    async fn is_canary_ready(&self, _canary: &Canary) -> Result<(), CanaryError> {
        Ok(())
    }

    async fn has_target_changed(&self, canary: &Canary) -> Result<bool, CanaryError> {
        let target = self.target(canary).await?;
        Ok(has_spec_changed(canary, &compute_hash(&target.spec)?))
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
        Ok(TargetMetadata::default())
    }

    async fn sync_status(&self, canary: &Canary, status: CanaryStatus) -> Result<(), CanaryError> {
        let target = self.target(canary).await?;
        let hash = compute_hash(&target.spec)?;
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
#[path = "service_test.rs"]
mod tests;
