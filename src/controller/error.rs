use crate::cluster::retry::AsConflict;
use crate::cluster::ClusterError;
use thiserror::Error;

/// Errors returned by the workload controllers, trackers and scaler reconcilers
///
/// Readiness checks report "still converging" as [`CanaryError::NotReady`];
/// callers branch on [`CanaryError::is_retryable`] to decide between polling
/// again and failing the rollout.
#[derive(Debug, Error)]
pub enum CanaryError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("{kind} {namespace}/{name} not ready: {reason}")]
    NotReady {
        kind: String,
        namespace: String,
        name: String,
        reason: String,
        retryable: bool,
    },

    #[error("{kind} {namespace}/{name} selector does not contain any of the labels {candidates:?}")]
    SelectorLabel {
        kind: String,
        namespace: String,
        name: String,
        candidates: Vec<String>,
    },

    #[error("Invalid {kind} {namespace}/{name}: {reason}")]
    InvalidTarget {
        kind: String,
        namespace: String,
        name: String,
        reason: String,
    },

    #[error("Unsupported kind: {0}")]
    UnsupportedKind(String),

    #[error("Canary {0} has no namespace")]
    MissingNamespace(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Failed to serialize {0}")]
    Serialization(String),
}

impl CanaryError {
    pub fn not_ready(
        kind: &str,
        namespace: &str,
        name: &str,
        reason: impl Into<String>,
        retryable: bool,
    ) -> Self {
        CanaryError::NotReady {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            reason: reason.into(),
            retryable,
        }
    }

    pub fn invalid_target(kind: &str, namespace: &str, name: &str, reason: impl Into<String>) -> Self {
        CanaryError::InvalidTarget {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the scheduler should call again instead of failing the rollout
    pub fn is_retryable(&self) -> bool {
        match self {
            CanaryError::Cluster(e) => e.is_retryable(),
            CanaryError::NotReady { retryable, .. } => *retryable,
            CanaryError::SelectorLabel { .. }
            | CanaryError::InvalidTarget { .. }
            | CanaryError::UnsupportedKind(_)
            | CanaryError::MissingNamespace(_)
            | CanaryError::MissingField(_)
            | CanaryError::Serialization(_) => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CanaryError::Cluster(e) if e.is_not_found())
    }
}

impl AsConflict for CanaryError {
    fn is_conflict(&self) -> bool {
        matches!(self, CanaryError::Cluster(e) if e.is_conflict())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let not_found = CanaryError::from(ClusterError::NotFound {
            kind: "Deployment".to_string(),
            namespace: "test".to_string(),
            name: "podinfo".to_string(),
        });
        assert!(not_found.is_retryable());
        assert!(not_found.is_not_found());

        let waiting = CanaryError::not_ready("Deployment", "test", "podinfo", "waiting", true);
        assert!(waiting.is_retryable());

        let stuck = CanaryError::not_ready("Deployment", "test", "podinfo", "exceeded", false);
        assert!(!stuck.is_retryable());

        let selector = CanaryError::SelectorLabel {
            kind: "Deployment".to_string(),
            namespace: "test".to_string(),
            name: "podinfo".to_string(),
            candidates: vec!["app".to_string()],
        };
        assert!(!selector.is_retryable());
        assert!(selector.to_string().contains("test/podinfo"));
    }
}
