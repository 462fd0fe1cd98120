//! Fingerprints of target specs and drift detection against Canary status

use super::CanaryError;
use crate::crd::canary::Canary;
use serde::Serialize;

/// Stable 16-character fingerprint of any serializable value
///
/// FNV-1a over the JSON encoding. Struct fields serialize in declaration
/// order and maps are `BTreeMap`s, so the encoding is deterministic across
/// processes, unlike `DefaultHasher`/SipHash.
///
/// # Errors
/// Returns `Serialization` if the value cannot be encoded as JSON
pub fn compute_hash<T: Serialize>(value: &T) -> Result<String, CanaryError> {
    let json = serde_json::to_string(value).map_err(|e| CanaryError::Serialization(e.to_string()))?;

    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in json.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }

    Ok(format!("{hash:016x}"))
}

/// Whether `hash` is a change the scheduler has not seen yet
///
/// - Nothing applied yet: changed
/// - Equal to the last promoted spec: a rollback to what runs on the primary, not a change
/// - Different from the last applied spec: changed
pub fn has_spec_changed(canary: &Canary, hash: &str) -> bool {
    let Some(status) = canary.status.as_ref() else {
        return true;
    };

    let last_applied = status.last_applied_spec.as_deref().unwrap_or_default();
    if last_applied.is_empty() {
        return true;
    }

    if status.last_promoted_spec.as_deref() == Some(hash) {
        return false;
    }

    last_applied != hash
}
