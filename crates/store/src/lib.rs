//! In-RAM object store with optimistic concurrency.
//!
//! Mirrors the parts of API server behaviour the reconciler relies on: store
//! assigned identity fields, resourceVersion checks on every write, and a
//! status sub-resource that plain replaces cannot touch. Faults can be queued
//! per operation and kind, and every call is journaled for assertions.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use jsrv_core::{ObjectKey, ObjectStore, StoreError, Stored};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    Create,
    Replace,
    ReplaceStatus,
}

impl Op {
    pub fn is_write(&self) -> bool { !matches!(self, Op::Get) }
}

/// One journaled store call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    pub kind: String,
    pub key: ObjectKey,
}

#[derive(Debug)]
struct Fault {
    op: Op,
    kind: String,
    remaining: usize,
    error: StoreError,
}

#[derive(Default)]
struct Inner {
    objects: FxHashMap<(String, ObjectKey), Json>,
    next_rv: u64,
    faults: Vec<Fault>,
    journal: Vec<Call>,
}

impl Inner {
    fn bump_rv(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    /// Record the call and pop a queued fault for it, if any.
    fn enter(&mut self, op: Op, kind: &str, key: &ObjectKey) -> Result<(), StoreError> {
        self.journal.push(Call { op, kind: kind.to_string(), key: key.clone() });
        let hit = self.faults.iter_mut().position(|f| f.op == op && f.kind == kind && f.remaining > 0);
        if let Some(idx) = hit {
            let fault = &mut self.faults[idx];
            fault.remaining -= 1;
            let err = fault.error.clone();
            if fault.remaining == 0 {
                self.faults.remove(idx);
            }
            debug!(?op, kind, key = %key, error = %err, "injected store fault");
            return Err(err);
        }
        Ok(())
    }
}

/// In-memory `ObjectStore`.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

fn kind_of<K: Stored>() -> String { K::kind(&()).into_owned() }

fn key_of<K: Stored>(obj: &K) -> Result<ObjectKey, StoreError> {
    ObjectKey::of(obj).ok_or_else(|| StoreError::Rejected { code: 422, message: format!("{} {} has no namespace", kind_of::<K>(), obj.name_any()) })
}

fn rv_of(v: &Json) -> Option<&str> { v.get("metadata").and_then(|m| m.get("resourceVersion")).and_then(|s| s.as_str()) }

fn set_meta(v: &mut Json, field: &str, value: Json) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.insert(field.to_string(), value);
    }
}

fn copy_meta(dst: &mut Json, src: &Json, field: &str) {
    match src.get("metadata").and_then(|m| m.get(field)) {
        Some(value) => set_meta(dst, field, value.clone()),
        None => {
            if let Some(meta) = dst.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                meta.remove(field);
            }
        }
    }
}

/// Everything outside metadata and status, used to decide generation bumps.
fn content(v: &Json) -> Json {
    let mut v = v.clone();
    if let Some(obj) = v.as_object_mut() {
        obj.remove("metadata");
        obj.remove("status");
    }
    v
}

impl MemStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Transient("store lock poisoned".into()))
    }

    /// Insert an object as if an external actor had created it.
    pub fn seed<K: Stored>(&self, obj: &K) -> Result<K, StoreError> {
        let key = key_of(obj)?;
        let mut inner = self.lock()?;
        Self::insert_new(&mut inner, obj, key)
    }

    fn insert_new<K: Stored>(inner: &mut Inner, obj: &K, key: ObjectKey) -> Result<K, StoreError> {
        let kind = kind_of::<K>();
        if inner.objects.contains_key(&(kind.clone(), key.clone())) {
            return Err(StoreError::Conflict { kind, key, message: "already exists".into() });
        }
        let mut fresh = obj.clone();
        let rv = inner.bump_rv();
        let meta = fresh.meta_mut();
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        meta.resource_version = Some(rv);
        meta.generation = Some(1);
        meta.creation_timestamp = Some(Time(chrono::Utc::now()));
        let raw = serde_json::to_value(&fresh)?;
        inner.objects.insert((kind, key), raw);
        Ok(fresh)
    }

    /// Queue a failure for the next `times` calls of `op` on objects of `kind`.
    pub fn fail_next(&self, op: Op, kind: &str, times: usize, error: StoreError) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.faults.push(Fault { op, kind: kind.to_string(), remaining: times, error });
        }
    }

    /// Read an object without journaling or fault injection.
    pub fn peek<K: Stored>(&self, key: &ObjectKey) -> Option<K> {
        let inner = self.inner.lock().ok()?;
        let raw = inner.objects.get(&(kind_of::<K>(), key.clone()))?;
        serde_json::from_value(raw.clone()).ok()
    }

    /// Simulate a concurrent writer: bump the stored resourceVersion so any
    /// copy read earlier becomes stale.
    pub fn touch<K: Stored>(&self, key: &ObjectKey) -> bool {
        let Ok(mut inner) = self.inner.lock() else { return false };
        let rv = inner.bump_rv();
        match inner.objects.get_mut(&(kind_of::<K>(), key.clone())) {
            Some(raw) => {
                set_meta(raw, "resourceVersion", Json::String(rv));
                true
            }
            None => false,
        }
    }

    pub fn journal(&self) -> Vec<Call> { self.inner.lock().map(|i| i.journal.clone()).unwrap_or_default() }

    /// Journaled calls that attempted to write.
    pub fn writes(&self) -> Vec<Call> { self.journal().into_iter().filter(|c| c.op.is_write()).collect() }

    pub fn clear_journal(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.journal.clear();
        }
    }

    pub fn len(&self) -> usize { self.inner.lock().map(|i| i.objects.len()).unwrap_or(0) }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Number of stored objects of the given kind.
    pub fn count(&self, kind: &str) -> usize {
        self.inner.lock().map(|i| i.objects.keys().filter(|(k, _)| k == kind).count()).unwrap_or(0)
    }

    /// Shared write path for replace and replace_status: checks the
    /// resourceVersion and lets `merge` build the stored value.
    fn write_existing<K, F>(&self, op: Op, obj: &K, merge: F) -> Result<K, StoreError>
    where
        K: Stored,
        F: FnOnce(&Json, Json) -> Json,
    {
        let kind = kind_of::<K>();
        let key = key_of(obj)?;
        let mut inner = self.lock()?;
        inner.enter(op, &kind, &key)?;
        let slot = (kind.clone(), key.clone());
        let Some(current) = inner.objects.get(&slot).cloned() else {
            return Err(StoreError::NotFound { kind, key });
        };
        if let Some(rv) = obj.resource_version() {
            if Some(rv.as_str()) != rv_of(&current) {
                return Err(StoreError::Conflict {
                    kind,
                    key,
                    message: format!("resourceVersion {} is stale (current {})", rv, rv_of(&current).unwrap_or("")),
                });
            }
        }
        let incoming = serde_json::to_value(obj)?;
        let mut next = merge(&current, incoming);
        // Identity fields are owned by the store.
        for field in ["uid", "creationTimestamp", "generation"] {
            copy_meta(&mut next, &current, field);
        }
        if content(&next) != content(&current) {
            let generation = current.get("metadata").and_then(|m| m.get("generation")).and_then(|g| g.as_i64()).unwrap_or(0);
            set_meta(&mut next, "generation", Json::from(generation + 1));
        }
        let rv = inner.bump_rv();
        set_meta(&mut next, "resourceVersion", Json::String(rv));
        let out: K = serde_json::from_value(next.clone())?;
        inner.objects.insert(slot, next);
        Ok(out)
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemStore {
    async fn get<K: Stored>(&self, key: &ObjectKey) -> Result<Option<K>, StoreError> {
        let kind = kind_of::<K>();
        let mut inner = self.lock()?;
        inner.enter(Op::Get, &kind, key)?;
        match inner.objects.get(&(kind, key.clone())) {
            Some(raw) => Ok(Some(serde_json::from_value(raw.clone())?)),
            None => Ok(None),
        }
    }

    async fn create<K: Stored>(&self, obj: &K) -> Result<K, StoreError> {
        let key = key_of(obj)?;
        let mut inner = self.lock()?;
        inner.enter(Op::Create, &kind_of::<K>(), &key)?;
        Self::insert_new(&mut inner, obj, key)
    }

    async fn replace<K: Stored>(&self, obj: &K) -> Result<K, StoreError> {
        self.write_existing(Op::Replace, obj, |current, mut incoming| {
            if let Some(map) = incoming.as_object_mut() {
                match current.get("status") {
                    Some(status) => {
                        map.insert("status".into(), status.clone());
                    }
                    None => {
                        map.remove("status");
                    }
                }
            }
            incoming
        })
    }

    async fn replace_status<K: Stored>(&self, obj: &K) -> Result<K, StoreError> {
        self.write_existing(Op::ReplaceStatus, obj, |current, incoming| {
            let mut next = current.clone();
            if let Some(map) = next.as_object_mut() {
                match incoming.get("status") {
                    Some(status) => {
                        map.insert("status".into(), status.clone());
                    }
                    None => {
                        map.remove("status");
                    }
                }
            }
            next
        })
    }
}
