//! Access to the Kubernetes API behind a trait
//!
//! Controllers are generic over [`Cluster`] so they can run against a real
//! [`kube::Client`] or the in-memory store used by the tests. Writes that
//! carry `metadata.resourceVersion` are conditional: a stale version is
//! rejected with [`ClusterError::Conflict`].

pub mod retry;

#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use thiserror::Error;

pub use retry::{retry_on_conflict, Backoff};

/// Any namespaced resource the controllers read or write
pub trait ClusterResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> ClusterResource for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Errors from the API layer, tagged with the object they concern
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} was modified concurrently")]
    Conflict {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("Kubernetes API error on {kind} {namespace}/{name}: {source}")]
    Api {
        kind: String,
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("Failed to (de)serialize {kind} {namespace}/{name}: {message}")]
    Serialization {
        kind: String,
        namespace: String,
        name: String,
        message: String,
    },
}

impl ClusterError {
    pub fn not_found<K: ClusterResource>(namespace: &str, name: &str) -> Self {
        ClusterError::NotFound {
            kind: K::kind(&()).to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn conflict<K: ClusterResource>(namespace: &str, name: &str) -> Self {
        ClusterError::Conflict {
            kind: K::kind(&()).to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn already_exists<K: ClusterResource>(namespace: &str, name: &str) -> Self {
        ClusterError::AlreadyExists {
            kind: K::kind(&()).to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn serialization<K: ClusterResource>(
        namespace: &str,
        name: &str,
        err: impl std::fmt::Display,
    ) -> Self {
        ClusterError::Serialization {
            kind: K::kind(&()).to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            message: err.to_string(),
        }
    }

    /// Classify a client error by its HTTP status
    pub fn from_kube<K: ClusterResource>(err: kube::Error, namespace: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(ref resp) if resp.code == 404 => Self::not_found::<K>(namespace, name),
            kube::Error::Api(ref resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                Self::already_exists::<K>(namespace, name)
            }
            kube::Error::Api(ref resp) if resp.code == 409 => Self::conflict::<K>(namespace, name),
            kube::Error::SerdeError(e) => Self::serialization::<K>(namespace, name, e),
            source => ClusterError::Api {
                kind: K::kind(&()).to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
                source,
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists { .. })
    }

    /// Whether calling again later may succeed
    ///
    /// Client-side rejections (4xx other than 404/409/429) and serialization
    /// failures will not fix themselves.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClusterError::NotFound { .. }
            | ClusterError::Conflict { .. }
            | ClusterError::AlreadyExists { .. } => true,
            ClusterError::Api {
                source: kube::Error::Api(resp),
                ..
            } => resp.code == 429 || resp.code >= 500,
            ClusterError::Api { .. } => true,
            ClusterError::Serialization { .. } => false,
        }
    }
}

/// Namespaced CRUD used by the controllers
#[async_trait]
pub trait Cluster: Clone + Send + Sync + 'static {
    async fn get<K: ClusterResource>(&self, namespace: &str, name: &str) -> Result<K, ClusterError>;

    async fn create<K: ClusterResource>(&self, namespace: &str, object: &K)
        -> Result<K, ClusterError>;

    /// Replace the object; its resourceVersion, when set, must be current
    async fn replace<K: ClusterResource>(
        &self,
        namespace: &str,
        object: &K,
    ) -> Result<K, ClusterError>;

    /// JSON merge patch; a `metadata.resourceVersion` in the patch is a precondition
    async fn patch<K: ClusterResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, ClusterError>;

    /// JSON merge patch of the status subresource
    async fn patch_status<K: ClusterResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, ClusterError>;

    /// Fetch an object, mapping not-found to `None`
    async fn get_opt<K: ClusterResource>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, ClusterError> {
        match self.get::<K>(namespace, name).await {
            Ok(object) => Ok(Some(object)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Add `metadata.resourceVersion` to a merge patch so it only applies to that version
pub fn guard_patch(mut patch: serde_json::Value, resource_version: Option<&str>) -> serde_json::Value {
    if let Some(rv) = resource_version {
        patch["metadata"]["resourceVersion"] = serde_json::Value::String(rv.to_string());
    }
    patch
}

pub(crate) fn object_name<K: Resource>(object: &K) -> String {
    object.meta().name.clone().unwrap_or_default()
}

#[async_trait]
impl Cluster for kube::Client {
    async fn get<K: ClusterResource>(&self, namespace: &str, name: &str) -> Result<K, ClusterError> {
        let api: Api<K> = Api::namespaced(self.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| ClusterError::from_kube::<K>(e, namespace, name))
    }

    async fn create<K: ClusterResource>(
        &self,
        namespace: &str,
        object: &K,
    ) -> Result<K, ClusterError> {
        let api: Api<K> = Api::namespaced(self.clone(), namespace);
        api.create(&PostParams::default(), object)
            .await
            .map_err(|e| ClusterError::from_kube::<K>(e, namespace, &object_name(object)))
    }

    async fn replace<K: ClusterResource>(
        &self,
        namespace: &str,
        object: &K,
    ) -> Result<K, ClusterError> {
        let name = object_name(object);
        let api: Api<K> = Api::namespaced(self.clone(), namespace);
        api.replace(&name, &PostParams::default(), object)
            .await
            .map_err(|e| ClusterError::from_kube::<K>(e, namespace, &name))
    }

    async fn patch<K: ClusterResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, ClusterError> {
        let api: Api<K> = Api::namespaced(self.clone(), namespace);
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| ClusterError::from_kube::<K>(e, namespace, name))
    }

    async fn patch_status<K: ClusterResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, ClusterError> {
        let api: Api<K> = Api::namespaced(self.clone(), namespace);
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| ClusterError::from_kube::<K>(e, namespace, name))
    }
}
