//! Admission-time defaulting and review.
//!
//! Review for create and update is the same check the reconciler runs, so a
//! definition rejected here is rejected at reconcile time too.

use crate::crd::JsonServer;
use crate::validate::{validate, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// Fill in defaults an incoming definition left unset. Returns true when
/// anything changed.
pub fn apply_defaults(js: &mut JsonServer) -> bool {
    if js.spec.replica_count == 0 {
        js.spec.replica_count = 1;
        return true;
    }
    false
}

/// Decide whether the write is admitted.
pub fn review(js: &JsonServer, op: Operation) -> Result<(), ValidationError> {
    match op {
        Operation::Create | Operation::Update => validate(js),
        Operation::Delete => Ok(()),
    }
}
