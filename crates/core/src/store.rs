//! Object store seam: single-object get/create/replace with optimistic
//! concurrency, plus status replace.

use std::fmt;

use k8s_openapi::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};

/// Namespaced identity of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Key of an existing object; `None` when it carries no namespace.
    pub fn of<K: Resource>(obj: &K) -> Option<Self> {
        Some(Self::new(obj.namespace()?, obj.name_any()))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.namespace, self.name) }
}

/// Typed namespaced objects the store can hold.
pub trait Stored:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> Stored for T where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Store failures, classified by what the caller can do about them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not_found: {kind} {key}")]
    NotFound { kind: String, key: ObjectKey },
    /// Stale resourceVersion or a concurrent create.
    #[error("conflict: {kind} {key}: {message}")]
    Conflict { kind: String, key: ObjectKey, message: String },
    /// Connectivity, throttling or server-side failure.
    #[error("transient: {0}")]
    Transient(String),
    /// The store refused the object itself.
    #[error("rejected ({code}): {message}")]
    Rejected { code: u16, message: String },
    #[error("encode: {0}")]
    Encode(String),
}

impl StoreError {
    /// Whether retrying the same write later can succeed without anyone
    /// editing the definition.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::Transient(_) | StoreError::NotFound { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self { StoreError::Encode(e.to_string()) }
}

/// Single-object access to the cluster's object store.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object; `Ok(None)` when it does not exist.
    async fn get<K: Stored>(&self, key: &ObjectKey) -> Result<Option<K>, StoreError>;

    /// Create a new object. Fails with `Conflict` when it already exists.
    async fn create<K: Stored>(&self, obj: &K) -> Result<K, StoreError>;

    /// Replace an existing object. The object's resourceVersion must match the
    /// stored one; status is not written through this call.
    async fn replace<K: Stored>(&self, obj: &K) -> Result<K, StoreError>;

    /// Replace only the status sub-resource, with the same concurrency check.
    async fn replace_status<K: Stored>(&self, obj: &K) -> Result<K, StoreError>;
}
