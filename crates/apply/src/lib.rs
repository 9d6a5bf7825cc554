//! JsonServer apply: desired artifact builders, merge, and the
//! create-or-update applier with minimal diffs.

#![forbid(unsafe_code)]

pub mod desired;
pub mod merge;

use std::time::Instant;

use jsrv_core::{JsonServer, ObjectKey, ObjectStore, StoreError, Stored};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

/// Which write, if any, an apply performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Unchanged,
    Created,
    Updated,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Unchanged => "unchanged",
            Operation::Created => "created",
            Operation::Updated => "updated",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

/// Result of one create-or-update.
#[derive(Debug, Clone)]
pub struct Applied<K> {
    pub object: K,
    pub op: Operation,
    /// Field-level changes written by an update; empty otherwise.
    pub summary: DiffSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{kind} {key} is controlled by {owner}")]
    ForeignOwner { kind: String, key: String, owner: String },
    #[error("{kind} {name} has no namespace")]
    MissingNamespace { kind: String, name: String },
    #[error("encode: {0}")]
    Encode(String),
}

impl ApplyError {
    /// Transient store failures only; everything else needs a human.
    pub fn is_transient(&self) -> bool {
        match self {
            ApplyError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ApplyError {
    fn from(e: serde_json::Error) -> Self { ApplyError::Encode(e.to_string()) }
}

/// Controller owner reference pointing at the definition. `None` until the
/// store has assigned the definition a uid.
pub fn owner_reference(js: &JsonServer) -> Option<OwnerReference> { js.controller_owner_ref(&()) }

/// Create `desired` if absent, otherwise merge it into the stored object and
/// write it back only when something changed. Store errors are returned as-is.
pub async fn apply<S, K>(store: &S, owner: &OwnerReference, desired: &K) -> Result<Applied<K>, ApplyError>
where
    S: ObjectStore,
    K: Stored,
{
    let t0 = Instant::now();
    let kind = K::kind(&()).into_owned();
    let key = ObjectKey::of(desired).ok_or_else(|| ApplyError::MissingNamespace { kind: kind.clone(), name: desired.name_any() })?;

    let applied = match store.get::<K>(&key).await? {
        None => {
            let obj = merge::fresh(desired, owner)?;
            let object = store.create(&obj).await?;
            Applied { object, op: Operation::Created, summary: DiffSummary::default() }
        }
        Some(existing) => {
            let merged = merge::merge(&existing, desired, owner)?;
            let before = serde_json::to_value(&existing)?;
            let after = serde_json::to_value(&merged)?;
            if before == after {
                Applied { object: existing, op: Operation::Unchanged, summary: DiffSummary::default() }
            } else {
                let summary = diff_summary(&after, &before);
                let object = store.replace(&merged).await?;
                Applied { object, op: Operation::Updated, summary }
            }
        }
    };

    histogram!("jsrv_apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => kind.clone());
    counter!("jsrv_apply_total", 1u64, "kind" => kind.clone(), "op" => applied.op.as_str());
    debug!(kind = %kind, key = %key, op = %applied.op, adds = applied.summary.adds, updates = applied.summary.updates, removes = applied.summary.removes, "artifact applied");
    Ok(applied)
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, adds: &mut usize, ups: &mut usize, rems: &mut usize) {
        use serde_json::Value as V;
        match (a, b) {
            (V::Object(ao), V::Object(bo)) => {
                for (k, av) in ao.iter() {
                    if let Some(bv) = bo.get(k) {
                        if av == bv { continue; }
                        walk(av, bv, adds, ups, rems);
                    } else {
                        *adds += 1;
                    }
                }
                for (k, _bv) in bo.iter() {
                    if !ao.contains_key(k) { *rems += 1; }
                }
            }
            (V::Array(aa), V::Array(bb)) => {
                for (x, y) in aa.iter().zip(bb.iter()) {
                    if x != y { walk(x, y, adds, ups, rems); }
                }
                if aa.len() > bb.len() { *adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { *rems += bb.len() - aa.len(); }
            }
            // Scalars differ or type differs
            (av, bv) => { if av != bv { *ups += 1; } }
        }
    }
    let mut adds = 0usize; let mut ups = 0usize; let mut rems = 0usize;
    walk(target, base, &mut adds, &mut ups, &mut rems);
    DiffSummary { adds, updates: ups, removes: rems }
}
