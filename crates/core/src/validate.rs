//! Definition validation shared by the admission boundary and the reconciler.

use crate::crd::JsonServer;
use crate::naming::NAME_PREFIX;
use kube::ResourceExt;

/// First reason a definition is unacceptable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("metadata.name must follow the naming convention 'app-${{name}}': got {0:?}")]
    MissingPrefix(String),
    #[error("metadata.name must follow the naming convention 'app-${{name}}': name after 'app-' cannot be empty")]
    EmptySuffix,
    #[error("spec.configPayload is required")]
    MissingPayload,
    #[error("spec.configPayload is not valid JSON")]
    InvalidJson,
    #[error("spec.replicaCount must be at least 1: got {0}")]
    ReplicasBelowMinimum(i32),
}

/// Check name convention, payload and replica count, in that order.
pub fn validate(js: &JsonServer) -> Result<(), ValidationError> {
    let name = js.name_any();
    let suffix = name.strip_prefix(NAME_PREFIX).ok_or_else(|| ValidationError::MissingPrefix(name.clone()))?;
    if suffix.is_empty() {
        return Err(ValidationError::EmptySuffix);
    }

    if js.spec.config_payload.is_empty() {
        return Err(ValidationError::MissingPayload);
    }
    // Any JSON value is acceptable, not only objects.
    serde_json::from_str::<serde_json::Value>(&js.spec.config_payload).map_err(|_| ValidationError::InvalidJson)?;

    if js.spec.replica_count < 1 {
        return Err(ValidationError::ReplicasBelowMinimum(js.spec.replica_count));
    }
    Ok(())
}
