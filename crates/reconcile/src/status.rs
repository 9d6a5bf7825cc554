//! Status reporting for JsonServer definitions.

use jsrv_core::{JsonServer, JsonServerStatus, ObjectKey, ObjectStore, StoreError};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// What happened to the status sub-resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusWrite {
    Written,
    /// The stored status already matched.
    Unchanged,
    /// The definition disappeared before the write.
    Gone,
}

/// Re-fetch the latest definition and overwrite its status.
///
/// The re-fetch narrows the window for clobbering a concurrent writer; a
/// conflict that still happens is returned to the caller like any other
/// store error.
pub async fn report<S: ObjectStore>(store: &S, key: &ObjectKey, status: &JsonServerStatus) -> Result<StatusWrite, StoreError> {
    let Some(mut latest) = store.get::<JsonServer>(key).await? else {
        debug!(key = %key, "definition gone before status write");
        return Ok(StatusWrite::Gone);
    };
    if latest.status.as_ref() == Some(status) {
        return Ok(StatusWrite::Unchanged);
    }
    latest.status = Some(status.clone());
    store.replace_status(&latest).await?;
    let state = status.state.map(|s| s.as_str()).unwrap_or("");
    counter!("jsrv_status_write_total", 1u64, "state" => state);
    debug!(key = %key, state, message = %status.message, replicas = status.replicas, "status written");
    Ok(StatusWrite::Written)
}
