//! Canary status writes
//!
//! Every write is a merge patch of the status subresource that carries the
//! resourceVersion it was computed from. The first attempt uses the Canary
//! the caller passed in; after a conflict the Canary is re-read and the
//! change recomputed.

use super::{canary_namespace, CanaryError, Context};
use crate::cluster::{guard_patch, retry_on_conflict, Cluster};
use crate::crd::canary::{Canary, CanaryCondition, CanaryPhase, CanaryStatus};
use async_trait::async_trait;
use kube::ResourceExt;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Type of the condition summarising the rollout
pub const PROMOTED_CONDITION: &str = "Promoted";

/// Writes the fields of the Canary status the workload controllers own
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Overwrite phase, weight, failed checks and iterations, record the
    /// target fingerprint as the last applied spec and, when given, the
    /// tracked config checksums
    async fn sync(
        &self,
        canary: &Canary,
        status: CanaryStatus,
        spec_hash: String,
        tracked_configs: Option<BTreeMap<String, String>>,
    ) -> Result<(), CanaryError>;

    async fn set_failed_checks(&self, canary: &Canary, val: i32) -> Result<(), CanaryError>;

    async fn set_weight(&self, canary: &Canary, val: i32) -> Result<(), CanaryError>;

    async fn set_iterations(&self, canary: &Canary, val: i32) -> Result<(), CanaryError>;

    /// Move to `phase`
    ///
    /// Weight and iterations are reset outside `Progressing` and `Waiting`.
    /// Entering `Initialized` or `Succeeded` records the last applied spec
    /// as promoted.
    async fn set_phase(&self, canary: &Canary, phase: CanaryPhase) -> Result<(), CanaryError>;
}

/// [`StatusStore`] backed by the cluster API
pub struct StatusWriter<C: Cluster> {
    ctx: Context<C>,
}

impl<C: Cluster> StatusWriter<C> {
    pub fn new(ctx: Context<C>) -> Self {
        Self { ctx }
    }

    /// Apply `mutate` to the current status and persist the result
    ///
    /// `mutate` receives the stored status and the Canary it was read from,
    /// and runs once per attempt.
    async fn update<F>(&self, canary: &Canary, mutate: F) -> Result<(), CanaryError>
    where
        F: Fn(&Canary, &mut CanaryStatus) + Send + Sync,
    {
        let namespace = canary_namespace(canary)?;
        let name = canary.name_any();
        let first_try = AtomicBool::new(true);

        let cluster = &self.ctx.cluster;
        let first_try = &first_try;
        let mutate = &mutate;
        let (namespace, name) = (namespace.as_str(), name.as_str());

        retry_on_conflict(self.ctx.backoff, move || async move {
            let current = if first_try.swap(false, Ordering::SeqCst) {
                canary.clone()
            } else {
                cluster.get::<Canary>(namespace, name).await?
            };

            let old = current.status.clone().unwrap_or_default();
            let mut new = old.clone();
            mutate(&current, &mut new);

            let patch = status_patch(current.metadata.resource_version.as_deref(), &old, &new)?;
            cluster.patch_status::<Canary>(namespace, name, &patch).await?;
            debug!(canary = %name, namespace = %namespace, phase = ?new.phase, "Canary status updated");
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl<C: Cluster> StatusStore for StatusWriter<C> {
    async fn sync(
        &self,
        canary: &Canary,
        status: CanaryStatus,
        spec_hash: String,
        tracked_configs: Option<BTreeMap<String, String>>,
    ) -> Result<(), CanaryError> {
        let now = self.ctx.clock.now_rfc3339();
        let phase = status.phase.unwrap_or_default();
        self.update(canary, |current, next| {
            next.phase = Some(phase);
            next.canary_weight = status.canary_weight;
            next.failed_checks = status.failed_checks;
            next.iterations = status.iterations;
            next.last_applied_spec = Some(spec_hash.clone());
            next.last_transition_time = Some(now.clone());
            if let Some(tracked) = &tracked_configs {
                next.tracked_configs = Some(tracked.clone());
            }
            if let Some(conditions) = make_status_conditions(current, phase, &now) {
                next.conditions = conditions;
            }
        })
        .await
    }

    async fn set_failed_checks(&self, canary: &Canary, val: i32) -> Result<(), CanaryError> {
        let now = self.ctx.clock.now_rfc3339();
        self.update(canary, |_, next| {
            next.failed_checks = val;
            next.last_transition_time = Some(now.clone());
        })
        .await
    }

    async fn set_weight(&self, canary: &Canary, val: i32) -> Result<(), CanaryError> {
        let now = self.ctx.clock.now_rfc3339();
        self.update(canary, |_, next| {
            next.canary_weight = val;
            next.last_transition_time = Some(now.clone());
        })
        .await
    }

    async fn set_iterations(&self, canary: &Canary, val: i32) -> Result<(), CanaryError> {
        let now = self.ctx.clock.now_rfc3339();
        self.update(canary, |_, next| {
            next.iterations = val;
            next.last_transition_time = Some(now.clone());
        })
        .await
    }

    async fn set_phase(&self, canary: &Canary, phase: CanaryPhase) -> Result<(), CanaryError> {
        let now = self.ctx.clock.now_rfc3339();
        self.update(canary, |current, next| {
            next.phase = Some(phase);
            next.last_transition_time = Some(now.clone());
            if !matches!(phase, CanaryPhase::Progressing | CanaryPhase::Waiting) {
                next.canary_weight = 0;
                next.iterations = 0;
            }
            if matches!(phase, CanaryPhase::Initialized | CanaryPhase::Succeeded) {
                next.last_promoted_spec = current
                    .status
                    .as_ref()
                    .and_then(|s| s.last_applied_spec.clone());
            }
            if let Some(conditions) = make_status_conditions(current, phase, &now) {
                next.conditions = conditions;
            }
        })
        .await
    }
}

/// Conditions with the `Promoted` condition set for `phase`
///
/// Returns `None` when the current condition already has the same status
/// and reason. When only the reason changes the transition time is kept.
pub fn make_status_conditions(
    canary: &Canary,
    phase: CanaryPhase,
    now: &str,
) -> Option<Vec<CanaryCondition>> {
    let kind = canary.spec.target_ref.kind.as_str();
    let (status, message) = match phase {
        CanaryPhase::Initializing => ("Unknown", format!("New {kind} detected, starting initialization.")),
        CanaryPhase::Initialized => ("True", format!("{kind} initialization completed.")),
        CanaryPhase::Waiting => ("Unknown", "Waiting for approval.".to_string()),
        CanaryPhase::Progressing => (
            "Unknown",
            "New revision detected, starting canary analysis.".to_string(),
        ),
        CanaryPhase::Promoting => (
            "Unknown",
            "Canary analysis completed, starting primary rolling update.".to_string(),
        ),
        CanaryPhase::Finalising => (
            "Unknown",
            "Canary analysis completed, routing all traffic to primary.".to_string(),
        ),
        CanaryPhase::Succeeded => (
            "True",
            "Canary analysis completed successfully, promotion finished.".to_string(),
        ),
        CanaryPhase::Failed => ("False", format!("Canary analysis failed, {kind} scaled to zero.")),
    };

    let conditions = canary
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();
    let current = conditions.iter().find(|c| c.type_ == PROMOTED_CONDITION);

    let mut condition = CanaryCondition {
        type_: PROMOTED_CONDITION.to_string(),
        status: status.to_string(),
        last_update_time: Some(now.to_string()),
        last_transition_time: Some(now.to_string()),
        reason: Some(phase.as_str().to_string()),
        message: Some(message),
    };

    if let Some(current) = current {
        if current.status == condition.status {
            if current.reason == condition.reason {
                return None;
            }
            condition.last_transition_time = current.last_transition_time.clone();
        }
    }

    let mut res: Vec<CanaryCondition> = conditions
        .iter()
        .filter(|c| c.type_ != PROMOTED_CONDITION)
        .cloned()
        .collect();
    res.push(condition);
    Some(res)
}

/// Merge patch turning `old` into `new`, guarded by `resource_version`
fn status_patch(
    resource_version: Option<&str>,
    old: &CanaryStatus,
    new: &CanaryStatus,
) -> Result<Value, CanaryError> {
    let to_value = |s: &CanaryStatus| {
        serde_json::to_value(s).map_err(|e| CanaryError::Serialization(e.to_string()))
    };
    let patch = json!({ "status": merge_diff(&to_value(old)?, &to_value(new)?) });
    Ok(guard_patch(patch, resource_version))
}

/// RFC 7386 patch that turns `old` into `new`; removed keys become `null`
pub(crate) fn merge_diff(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for (key, value) in new {
                match old.get(key) {
                    Some(previous) if previous == value => {}
                    Some(previous) => {
                        patch.insert(key.clone(), merge_diff(previous, value));
                    }
                    None => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            for key in old.keys().filter(|k| !new.contains_key(*k)) {
                patch.insert(key.clone(), Value::Null);
            }
            Value::Object(patch)
        }
        _ => new.clone(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "status_test.rs"]
mod tests;
