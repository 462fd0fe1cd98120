//! Workload controllers and their building blocks
//!
//! The external scheduler drives one rollout through the [`Controller`]
//! contract: `initialize`, then repeated readiness and drift checks, then
//! `promote` and `finalize`. Every call is a single point-in-time step that
//! is safe to repeat.

pub mod clock;
pub mod error;
pub mod factory;
pub mod metadata;
pub mod scaler;
pub mod spec;
pub mod status;
pub mod tracker;
pub mod workload;

#[cfg(test)]
pub(crate) mod testing;

pub use error::CanaryError;
pub use factory::Factory;

use crate::cluster::{Backoff, Cluster};
use crate::config::CoreConfig;
use crate::crd::canary::{Canary, CanaryPhase, CanaryStatus};
use async_trait::async_trait;
use clock::{Clock, SystemClock};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use status::StatusStore;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Shared dependencies of controllers, trackers and scaler reconcilers
pub struct Context<C: Cluster> {
    pub cluster: C,
    pub config: Arc<CoreConfig>,
    pub clock: Arc<dyn Clock>,
    pub backoff: Backoff,
}

impl<C: Cluster> Clone for Context<C> {
    fn clone(&self) -> Self {
        Self {
            cluster: self.cluster.clone(),
            config: self.config.clone(),
            clock: self.clock.clone(),
            backoff: self.backoff,
        }
    }
}

impl<C: Cluster> Context<C> {
    pub fn new(cluster: C, config: CoreConfig) -> Self {
        Self {
            cluster,
            config: Arc::new(config),
            clock: Arc::new(SystemClock),
            backoff: Backoff::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Selector label and discovered ports of a target
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetMetadata {
    /// Selector label key, e.g. `app`
    pub label: String,
    /// Value of the selector label on the target
    pub label_value: String,
    /// Extra container ports when port discovery is enabled
    pub ports: Option<BTreeMap<String, i32>>,
}

/// Operations the scheduler needs for one kind of workload
///
/// Readiness checks return `Ok(())` when ready. Otherwise the error says
/// whether to poll again ([`CanaryError::is_retryable`]) or give up.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Create the primary if absent; on the first pass wait for it and scale
    /// the target down, then create the primary autoscaler if absent
    async fn initialize(&self, canary: &Canary, skip_liveness_checks: bool)
        -> Result<(), CanaryError>;

    /// Copy the target's spec onto the primary and update the primary autoscaler
    async fn promote(&self, canary: &Canary) -> Result<(), CanaryError>;

    async fn is_primary_ready(&self, canary: &Canary) -> Result<(), CanaryError>;

    async fn is_canary_ready(&self, canary: &Canary) -> Result<(), CanaryError>;

    /// Whether the target spec changed since the last sync, ignoring
    /// reverts to the promoted spec
    async fn has_target_changed(&self, canary: &Canary) -> Result<bool, CanaryError>;

    async fn have_dependencies_changed(&self, canary: &Canary) -> Result<bool, CanaryError>;

    async fn scale(&self, canary: &Canary, replicas: i32) -> Result<(), CanaryError>;

    async fn scale_to_zero(&self, canary: &Canary) -> Result<(), CanaryError>;

    async fn scale_from_zero(&self, canary: &Canary) -> Result<(), CanaryError>;

    async fn get_metadata(&self, canary: &Canary) -> Result<TargetMetadata, CanaryError>;

    /// Persist `status`, fingerprinting the target and its configs
    async fn sync_status(&self, canary: &Canary, status: CanaryStatus)
        -> Result<(), CanaryError>;

    /// Undo the target scale-down
    async fn finalize(&self, canary: &Canary) -> Result<(), CanaryError>;

    fn status_store(&self) -> &dyn StatusStore;

    async fn set_status_failed_checks(&self, canary: &Canary, val: i32) -> Result<(), CanaryError> {
        self.status_store().set_failed_checks(canary, val).await
    }

    async fn set_status_weight(&self, canary: &Canary, val: i32) -> Result<(), CanaryError> {
        self.status_store().set_weight(canary, val).await
    }

    async fn set_status_iterations(&self, canary: &Canary, val: i32) -> Result<(), CanaryError> {
        self.status_store().set_iterations(canary, val).await
    }

    async fn set_status_phase(&self, canary: &Canary, phase: CanaryPhase) -> Result<(), CanaryError> {
        self.status_store().set_phase(canary, phase).await
    }
}

pub fn canary_namespace(canary: &Canary) -> Result<String, CanaryError> {
    canary
        .metadata
        .namespace
        .clone()
        .ok_or_else(|| CanaryError::MissingNamespace(canary.metadata.name.clone().unwrap_or_default()))
}

/// Controller owner reference so primaries are collected with the Canary
pub fn owner_reference(canary: &Canary) -> Result<OwnerReference, CanaryError> {
    canary
        .controller_owner_ref(&())
        .ok_or_else(|| CanaryError::MissingField("Canary metadata.uid".to_string()))
}

/// Whether the Canary has not been initialized yet
pub fn is_initial_phase(canary: &Canary) -> bool {
    matches!(canary.phase(), CanaryPhase::Initializing)
}
