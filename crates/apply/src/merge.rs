//! Merge a desired artifact shape into the stored object.
//!
//! Only builder-controlled fields are copied: labels (key-wise), the owner
//! reference (upserted by uid) and every top-level field besides `metadata`
//! and `status`. Objects merge key-wise, arrays of equal length merge
//! element-wise, anything else is replaced. The string maps the builders own
//! outright (config data, selectors, pod template labels) are replaced
//! wholesale so stray keys do not survive. Store-owned metadata
//! (resourceVersion, uid, generation, timestamps, managedFields) and
//! annotations are never touched.

use jsrv_core::{ObjectKey, Stored};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use serde_json::Value as Json;

use crate::ApplyError;

const SKIPPED_TOP_LEVEL: [&str; 4] = ["apiVersion", "kind", "metadata", "status"];

/// JSON pointers to maps copied from the desired shape as a whole.
const OWNED_MAPS: [&str; 4] = ["/data", "/spec/selector", "/spec/selector/matchLabels", "/spec/template/metadata/labels"];

/// Replace every owned map present in `want` with its desired value.
fn replace_owned(dst: &mut Json, want: &Json) {
    for path in OWNED_MAPS {
        if let (Some(slot), Some(value)) = (dst.pointer_mut(path), want.pointer(path)) {
            *slot = value.clone();
        }
    }
}

/// Recursively overlay `src` onto `dst`.
pub(crate) fn overlay(dst: &mut Json, src: &Json) {
    match src {
        Json::Object(s) => {
            if let Json::Object(d) = dst {
                for (k, sv) in s {
                    match d.get_mut(k) {
                        Some(dv) => overlay(dv, sv),
                        None => {
                            d.insert(k.clone(), sv.clone());
                        }
                    }
                }
                return;
            }
        }
        Json::Array(s) => {
            if let Json::Array(d) = dst {
                if d.len() == s.len() {
                    for (dv, sv) in d.iter_mut().zip(s) {
                        overlay(dv, sv);
                    }
                    return;
                }
            }
        }
        _ => {}
    }
    *dst = src.clone();
}

/// Owner references after making `owner` the controller. Refuses to take
/// over an object another controller already owns.
fn owner_refs<K: Stored>(obj: &K, owner: &OwnerReference) -> Result<Vec<OwnerReference>, ApplyError> {
    let mut refs = obj.owner_references().to_vec();
    if let Some(other) = refs.iter().find(|r| r.controller == Some(true) && r.uid != owner.uid) {
        return Err(ApplyError::ForeignOwner {
            kind: K::kind(&()).into_owned(),
            key: ObjectKey::of(obj).map(|k| k.to_string()).unwrap_or_else(|| obj.name_any()),
            owner: format!("{}/{}", other.kind, other.name),
        });
    }
    match refs.iter_mut().find(|r| r.uid == owner.uid) {
        Some(slot) => *slot = owner.clone(),
        None => refs.push(owner.clone()),
    }
    Ok(refs)
}

/// A brand-new object: the desired shape plus the owner reference.
pub fn fresh<K: Stored>(desired: &K, owner: &OwnerReference) -> Result<K, ApplyError> {
    let mut obj = desired.clone();
    let refs = owner_refs(&obj, owner)?;
    obj.meta_mut().owner_references = Some(refs);
    Ok(obj)
}

/// `existing` with the builder-controlled fields of `desired` copied in.
pub fn merge<K: Stored>(existing: &K, desired: &K, owner: &OwnerReference) -> Result<K, ApplyError> {
    let refs = owner_refs(existing, owner)?;

    let mut out = existing.clone();
    {
        let meta = out.meta_mut();
        if let Some(want) = &desired.meta().labels {
            meta.labels.get_or_insert_with(Default::default).extend(want.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        meta.owner_references = Some(refs);
    }

    let mut out_json = serde_json::to_value(&out)?;
    let want_json = serde_json::to_value(desired)?;
    if let (Some(dst), Some(src)) = (out_json.as_object_mut(), want_json.as_object()) {
        for (k, sv) in src.iter().filter(|(k, _)| !SKIPPED_TOP_LEVEL.contains(&k.as_str())) {
            match dst.get_mut(k) {
                Some(dv) => overlay(dv, sv),
                None => {
                    dst.insert(k.clone(), sv.clone());
                }
            }
        }
    }
    replace_owned(&mut out_json, &want_json);
    Ok(serde_json::from_value(out_json)?)
}
