use super::{ConfigRefs, ConfigScan, Tracker};
use crate::controller::CanaryError;
use crate::crd::canary::Canary;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::PodSpec;

/// Tracker used when dependency tracking is disabled: nothing is tracked
/// and nothing ever changes
pub struct NopTracker;

#[async_trait]
impl Tracker for NopTracker {
    async fn get_target_configs(&self, _canary: &Canary) -> Result<ConfigScan, CanaryError> {
        Ok(ConfigScan::default())
    }

    async fn has_config_changed(&self, _canary: &Canary) -> Result<bool, CanaryError> {
        Ok(false)
    }

    async fn create_primary_configs(
        &self,
        _canary: &Canary,
        _refs: &ConfigRefs,
    ) -> Result<(), CanaryError> {
        Ok(())
    }

    fn apply_primary_configs(&self, spec: PodSpec, _refs: &ConfigRefs) -> Result<PodSpec, CanaryError> {
        Ok(spec)
    }
}
