use super::{
    configs_changed, identity, referenced_configs, rewrite_config_refs, ConfigRef, ConfigRefType,
    ConfigRefs, ConfigScan, Tracker,
};
use crate::cluster::{object_name, Cluster, ClusterError, ClusterResource};
use crate::controller::metadata::{include_labels_by_prefix, primary_name};
use crate::controller::{canary_namespace, owner_reference, CanaryError, Context};
use crate::crd::canary::Canary;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PodSpec, Secret};
use kube::api::ObjectMeta;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Annotation on a ConfigMap/Secret; a value starting with `disable` stops tracking
pub const CONFIG_TRACKING_ANNOTATION: &str = "kanari.io/config-tracking";

/// Secret types whose content is tracked; registry and token secrets are not
const TRACKED_SECRET_TYPES: [&str; 4] = [
    "Opaque",
    "kubernetes.io/basic-auth",
    "kubernetes.io/ssh-auth",
    "kubernetes.io/tls",
];

/// Tracks ConfigMaps and Secrets through the cluster API
pub struct ConfigTracker<C: Cluster> {
    ctx: Context<C>,
}

impl<C: Cluster> ConfigTracker<C> {
    pub fn new(ctx: Context<C>) -> Self {
        Self { ctx }
    }

    /// Pod spec of the target, `None` for kinds without one
    async fn target_pod_spec(
        &self,
        canary: &Canary,
        namespace: &str,
    ) -> Result<Option<PodSpec>, CanaryError> {
        let target = &canary.spec.target_ref;
        let cluster = &self.ctx.cluster;
        let spec = match target.kind.as_str() {
            "Deployment" => cluster
                .get::<Deployment>(namespace, &target.name)
                .await?
                .spec
                .and_then(|s| s.template.spec),
            "DaemonSet" => cluster
                .get::<DaemonSet>(namespace, &target.name)
                .await?
                .spec
                .and_then(|s| s.template.spec),
            "StatefulSet" => cluster
                .get::<StatefulSet>(namespace, &target.name)
                .await?
                .spec
                .and_then(|s| s.template.spec),
            _ => None,
        };
        Ok(spec)
    }

    async fn fetch_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigRef>, ClusterError> {
        let config_map: ConfigMap = self.ctx.cluster.get(namespace, name).await?;
        if tracking_disabled(&config_map.metadata) {
            debug!(configmap = %name, namespace = %namespace, "Config tracking disabled by annotation");
            return Ok(None);
        }
        let checksum = checksum(&(&config_map.data, &config_map.binary_data))
            .map_err(|e| ClusterError::serialization::<ConfigMap>(namespace, name, e))?;
        Ok(Some(ConfigRef {
            name: name.to_string(),
            type_: ConfigRefType::ConfigMap,
            checksum,
        }))
    }

    async fn fetch_secret(&self, namespace: &str, name: &str) -> Result<Option<ConfigRef>, ClusterError> {
        let secret: Secret = self.ctx.cluster.get(namespace, name).await?;
        if !is_tracked_secret_type(secret.type_.as_deref()) {
            debug!(
                secret = %name,
                namespace = %namespace,
                secret_type = ?secret.type_,
                "Secret type is not tracked"
            );
            return Ok(None);
        }
        if tracking_disabled(&secret.metadata) {
            debug!(secret = %name, namespace = %namespace, "Config tracking disabled by annotation");
            return Ok(None);
        }
        let checksum = checksum(&secret.data)
            .map_err(|e| ClusterError::serialization::<Secret>(namespace, name, e))?;
        Ok(Some(ConfigRef {
            name: name.to_string(),
            type_: ConfigRefType::Secret,
            checksum,
        }))
    }

    async fn upsert_primary_config_map(
        &self,
        canary: &Canary,
        namespace: &str,
        name: &str,
    ) -> Result<(), CanaryError> {
        let source: ConfigMap = self.ctx.cluster.get(namespace, name).await?;
        let primary = ConfigMap {
            metadata: self.primary_metadata(canary, namespace, name, &source.metadata)?,
            data: source.data,
            binary_data: source.binary_data,
            immutable: source.immutable,
            ..Default::default()
        };
        self.upsert(namespace, primary).await
    }

    async fn upsert_primary_secret(
        &self,
        canary: &Canary,
        namespace: &str,
        name: &str,
    ) -> Result<(), CanaryError> {
        let source: Secret = self.ctx.cluster.get(namespace, name).await?;
        let primary = Secret {
            metadata: self.primary_metadata(canary, namespace, name, &source.metadata)?,
            data: source.data,
            type_: source.type_,
            immutable: source.immutable,
            ..Default::default()
        };
        self.upsert(namespace, primary).await
    }

    fn primary_metadata(
        &self,
        canary: &Canary,
        namespace: &str,
        name: &str,
        source: &ObjectMeta,
    ) -> Result<ObjectMeta, CanaryError> {
        Ok(ObjectMeta {
            name: Some(primary_name(name)),
            namespace: Some(namespace.to_string()),
            labels: Some(include_labels_by_prefix(
                source.labels.as_ref(),
                &self.ctx.config.include_label_prefix,
            )),
            owner_references: Some(vec![owner_reference(canary)?]),
            ..Default::default()
        })
    }

    /// Update, falling back to create when the copy does not exist yet
    async fn upsert<K: ClusterResource>(
        &self,
        namespace: &str,
        object: K,
    ) -> Result<(), CanaryError> {
        let name = object_name(&object);
        match self.ctx.cluster.replace(namespace, &object).await {
            Ok(_) => {
                info!(name = %name, namespace = %namespace, kind = %K::kind(&()), "Primary config updated");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                self.ctx.cluster.create(namespace, &object).await?;
                info!(name = %name, namespace = %namespace, kind = %K::kind(&()), "Primary config created");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl<C: Cluster> Tracker for ConfigTracker<C> {
    async fn get_target_configs(&self, canary: &Canary) -> Result<ConfigScan, CanaryError> {
        let namespace = canary_namespace(canary)?;
        let Some(spec) = self.target_pod_spec(canary, &namespace).await? else {
            return Ok(ConfigScan::default());
        };

        let referenced = referenced_configs(&spec)?;
        let fetches = referenced.iter().map(|(type_, name)| {
            let namespace = namespace.as_str();
            async move {
                match type_ {
                    ConfigRefType::ConfigMap => self.fetch_config_map(namespace, name).await,
                    ConfigRefType::Secret => self.fetch_secret(namespace, name).await,
                }
            }
        });
        let results = futures::future::join_all(fetches).await;

        let mut scan = ConfigScan::default();
        for ((type_, name), result) in referenced.iter().zip(results) {
            match result {
                Ok(Some(config)) => {
                    scan.refs.insert(config.identity(), config);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        canary = ?canary.metadata.name,
                        namespace = %namespace,
                        config = %identity(*type_, name),
                        error = %e,
                        "Skipping config reference that could not be read"
                    );
                    scan.skipped += 1;
                }
            }
        }

        debug!(
            canary = ?canary.metadata.name,
            tracked = scan.refs.len(),
            skipped = scan.skipped,
            "Scanned target configs"
        );
        Ok(scan)
    }

    async fn has_config_changed(&self, canary: &Canary) -> Result<bool, CanaryError> {
        let scan = self.get_target_configs(canary).await?;
        let tracked = canary.status.as_ref().and_then(|s| s.tracked_configs.as_ref());
        let changed = configs_changed(&scan.refs, tracked);
        if changed {
            info!(canary = ?canary.metadata.name, "Tracked configs changed");
        }
        Ok(changed)
    }

    async fn create_primary_configs(
        &self,
        canary: &Canary,
        refs: &ConfigRefs,
    ) -> Result<(), CanaryError> {
        let namespace = canary_namespace(canary)?;
        for config in refs.values() {
            match config.type_ {
                ConfigRefType::ConfigMap => {
                    self.upsert_primary_config_map(canary, &namespace, &config.name)
                        .await?
                }
                ConfigRefType::Secret => {
                    self.upsert_primary_secret(canary, &namespace, &config.name)
                        .await?
                }
            }
        }
        Ok(())
    }

    fn apply_primary_configs(&self, spec: PodSpec, refs: &ConfigRefs) -> Result<PodSpec, CanaryError> {
        rewrite_config_refs(spec, refs)
    }
}

fn is_tracked_secret_type(type_: Option<&str>) -> bool {
    // An unset type defaults to Opaque
    TRACKED_SECRET_TYPES.contains(&type_.unwrap_or("Opaque"))
}

fn tracking_disabled(meta: &ObjectMeta) -> bool {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(CONFIG_TRACKING_ANNOTATION))
        .map(|v| v.starts_with("disable"))
        .unwrap_or(false)
}

/// First 8 bytes of the SHA-256 of the JSON encoding, hex encoded
fn checksum<T: Serialize>(data: &T) -> Result<String, serde_json::Error> {
    let json = serde_json::to_vec(data)?;
    let digest = Sha256::digest(&json);
    Ok(hex::encode(&digest[..8]))
}
