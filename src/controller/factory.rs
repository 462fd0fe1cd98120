//! Controller selection by target kind

use super::scaler::{self, ScalerReconciler};
use super::tracker::{ConfigTracker, NopTracker, Tracker};
use super::workload::daemonset::DaemonSetController;
use super::workload::deployment::DeploymentController;
use super::workload::statefulset::StatefulSetController;
use super::workload::{KnativeController, ServiceController};
use super::{CanaryError, Context, Controller};
use crate::cluster::Cluster;
use crate::crd::canary::Canary;
use tracing::debug;

/// Builds the [`Controller`] matching a Canary's target
pub struct Factory<C: Cluster> {
    ctx: Context<C>,
}

impl<C: Cluster> Factory<C> {
    pub fn new(ctx: Context<C>) -> Self {
        Self { ctx }
    }

    fn tracker(&self) -> Box<dyn Tracker> {
        if self.ctx.config.enable_config_tracking {
            Box::new(ConfigTracker::new(self.ctx.clone()))
        } else {
            Box::new(NopTracker)
        }
    }

    /// Controller for the target of `canary`
    ///
    /// # Errors
    /// [`CanaryError::UnsupportedKind`] for kinds other than Deployment,
    /// DaemonSet, StatefulSet and (Knative) Service.
    pub fn controller(&self, canary: &Canary) -> Result<Box<dyn Controller>, CanaryError> {
        let target = &canary.spec.target_ref;
        let ctx = self.ctx.clone();
        let controller: Box<dyn Controller> = match target.kind.as_str() {
            "Deployment" => Box::new(DeploymentController::new(
                ctx,
                self.tracker(),
                self.scaler_reconciler(canary),
            )),
            "DaemonSet" => Box::new(DaemonSetController::new(ctx, self.tracker(), None)),
            "StatefulSet" => Box::new(StatefulSetController::new(
                ctx,
                self.tracker(),
                self.scaler_reconciler(canary),
            )),
            "Service" if target.is_knative_service() => Box::new(KnativeController::new(ctx)),
            "Service" => Box::new(ServiceController::new(ctx)),
            other => return Err(CanaryError::UnsupportedKind(other.to_string())),
        };
        debug!(kind = %target.kind, api_version = %target.api_version, "Selected controller");
        Ok(controller)
    }

    /// Reconciler for the autoscaler attached to `canary`, if any
    pub fn scaler_reconciler(&self, canary: &Canary) -> Option<Box<dyn ScalerReconciler>> {
        scaler::for_canary(&self.ctx, canary)
    }
}
