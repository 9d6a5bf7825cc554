//! JsonServer reconciler.
//!
//! One pass per reconcile signal, no state kept between passes:
//!
//! 1. fetch the definition (absent means deleted; nothing to do)
//! 2. validate it; a failure is written to status and ends the pass
//! 3. sync the config map, deployment and service, in that order
//! 4. write the success status
//!
//! Transient store failures leave status alone and are returned so the caller
//! retries the whole pass. Artifacts are only ever created or updated;
//! deletion is left to owner-reference garbage collection.

#![forbid(unsafe_code)]

pub mod status;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use jsrv_apply::{apply, desired, owner_reference, Applied, ApplyError, DiffSummary, Operation};
use jsrv_core::crd::UNEXPECTED_FAILURE_MESSAGE;
use jsrv_core::{validate, JsonServer, JsonServerStatus, ObjectKey, ObjectStore, StoreError, Stored, ValidationError};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use status::StatusWrite;

/// The dependent artifacts, in sync order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Artifact {
    Config,
    Workload,
    Network,
}

impl Artifact {
    pub const SYNC_ORDER: [Artifact; 3] = [Artifact::Config, Artifact::Workload, Artifact::Network];

    pub fn as_str(&self) -> &'static str {
        match self {
            Artifact::Config => "config",
            Artifact::Workload => "workload",
            Artifact::Network => "network",
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Per-artifact result of a sync step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactReport {
    pub artifact: Artifact,
    pub name: String,
    pub op: Operation,
    pub summary: DiffSummary,
}

impl ArtifactReport {
    fn from_applied<K: Stored>(artifact: Artifact, applied: Applied<K>) -> Self {
        Self { artifact, name: applied.object.name_any(), op: applied.op, summary: applied.summary }
    }
}

/// How a pass that did not fail ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// The definition no longer exists.
    Absent,
    /// Validation failed; no artifact was touched.
    Invalid { reason: ValidationError, status: JsonServerStatus, write: StatusWrite },
    Synced { artifacts: Vec<ArtifactReport>, status: JsonServerStatus, write: StatusWrite },
}

impl ReconcileOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Absent => "absent",
            ReconcileOutcome::Invalid { .. } => "invalid",
            ReconcileOutcome::Synced { .. } => "synced",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("fetching {key}: {source}")]
    Fetch { key: ObjectKey, #[source] source: StoreError },
    #[error("{key} has no uid; cannot own artifacts")]
    MissingUid { key: ObjectKey },
    /// A sync step failed. `reported` is set when the generic failure status
    /// was written (non-transient failures only); `status_error` holds the
    /// store error if that write was attempted and failed.
    #[error("syncing {artifact} of {key}: {source}")]
    Sync {
        key: ObjectKey,
        artifact: Artifact,
        reported: bool,
        status_error: Option<StoreError>,
        #[source]
        source: ApplyError,
    },
    #[error("writing status of {key}: {source}")]
    Status { key: ObjectKey, #[source] source: StoreError },
}

/// Drives one definition toward its desired artifacts per call.
pub struct Reconciler<S> {
    store: Arc<S>,
}

impl<S> Clone for Reconciler<S> {
    fn clone(&self) -> Self { Self { store: Arc::clone(&self.store) } }
}

impl<S: ObjectStore> Reconciler<S> {
    pub fn new(store: Arc<S>) -> Self { Self { store } }

    pub fn store(&self) -> &S { &self.store }

    /// Run a single reconcile pass for `key`.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome, ReconcileError> {
        let t0 = Instant::now();
        let res = self.pass(key).await;
        let label = match &res {
            Ok(outcome) => outcome.label(),
            Err(_) => "error",
        };
        histogram!("jsrv_reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("jsrv_reconcile_total", 1u64, "outcome" => label);
        res
    }

    async fn pass(&self, key: &ObjectKey) -> Result<ReconcileOutcome, ReconcileError> {
        let store = self.store.as_ref();
        let Some(js) = store.get::<JsonServer>(key).await.map_err(|source| ReconcileError::Fetch { key: key.clone(), source })? else {
            info!(key = %key, "JsonServer not found; assuming deleted");
            return Ok(ReconcileOutcome::Absent);
        };
        // Status mirrors what this pass attempted, whatever happens later.
        let attempted = js.declared_replicas();

        if let Err(reason) = validate(&js) {
            warn!(key = %key, reason = %reason, "JsonServer failed validation");
            let status = JsonServerStatus::error(format!("Error: {reason}"), attempted);
            let write = self.report(key, &status).await?;
            return Ok(ReconcileOutcome::Invalid { reason, status, write });
        }

        let owner = owner_reference(&js).ok_or_else(|| ReconcileError::MissingUid { key: key.clone() })?;
        let mut artifacts = Vec::with_capacity(Artifact::SYNC_ORDER.len());
        for artifact in Artifact::SYNC_ORDER {
            match self.sync(artifact, &js, &owner).await {
                Ok(report) => {
                    info!(key = %key, artifact = %artifact, name = %report.name, op = %report.op, "artifact reconciled");
                    artifacts.push(report);
                }
                Err(source) => return Err(self.fail(key, artifact, source, attempted).await),
            }
        }

        let status = JsonServerStatus::synced(attempted);
        let write = self.report(key, &status).await?;
        debug!(key = %key, ?write, "pass complete");
        Ok(ReconcileOutcome::Synced { artifacts, status, write })
    }

    async fn sync(&self, artifact: Artifact, js: &JsonServer, owner: &OwnerReference) -> Result<ArtifactReport, ApplyError> {
        let store = self.store.as_ref();
        let report = match artifact {
            Artifact::Config => ArtifactReport::from_applied(artifact, apply(store, owner, &desired::config_map(js)).await?),
            Artifact::Workload => ArtifactReport::from_applied(artifact, apply(store, owner, &desired::deployment(js)).await?),
            Artifact::Network => ArtifactReport::from_applied(artifact, apply(store, owner, &desired::service(js)).await?),
        };
        Ok(report)
    }

    /// Turn a failed sync step into the pass error. Non-transient failures
    /// also get a generic error status; transient ones leave status alone.
    async fn fail(&self, key: &ObjectKey, artifact: Artifact, source: ApplyError, attempted: i32) -> ReconcileError {
        warn!(key = %key, artifact = %artifact, error = %source, transient = source.is_transient(), "artifact sync failed");
        let mut reported = false;
        let mut status_error = None;
        if !source.is_transient() {
            let status = JsonServerStatus::error(UNEXPECTED_FAILURE_MESSAGE, attempted);
            match status::report(self.store.as_ref(), key, &status).await {
                Ok(_) => reported = true,
                Err(e) => {
                    warn!(key = %key, error = %e, "failed to record failure status");
                    status_error = Some(e);
                }
            }
        }
        ReconcileError::Sync { key: key.clone(), artifact, reported, status_error, source }
    }

    async fn report(&self, key: &ObjectKey, status: &JsonServerStatus) -> Result<StatusWrite, ReconcileError> {
        status::report(self.store.as_ref(), key, status)
            .await
            .map_err(|source| ReconcileError::Status { key: key.clone(), source })
    }
}
