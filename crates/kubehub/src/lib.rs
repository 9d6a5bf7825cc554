//! JsonServer kubehub: the Kubernetes API as an `ObjectStore`, and the
//! watcher/controller wiring that feeds reconcile signals to the core.

#![forbid(unsafe_code)]

pub mod controller;

use anyhow::{Context, Result};
use jsrv_core::{ObjectKey, ObjectStore, StoreError, Stored};
use kube::{
    api::{Api, PostParams},
    Client, ResourceExt,
};
use metrics::counter;
use tracing::debug;

pub use controller::{run, ControllerConfig};

/// Build a client from the ambient kubeconfig or in-cluster service account.
pub async fn client() -> Result<Client> {
    Client::try_default().await.context("building kube client (kubeconfig or in-cluster config)")
}

/// Classify a kube client error for the reconciler.
pub fn map_kube_error(kind: &str, key: &ObjectKey, err: kube::Error) -> StoreError {
    let mapped = match err {
        kube::Error::Api(ae) => match ae.code {
            404 => StoreError::NotFound { kind: kind.to_string(), key: key.clone() },
            409 => StoreError::Conflict { kind: kind.to_string(), key: key.clone(), message: ae.message },
            429 | 500..=599 => StoreError::Transient(format!("{} ({}): {}", ae.reason, ae.code, ae.message)),
            code => StoreError::Rejected { code, message: ae.message },
        },
        kube::Error::SerdeError(e) => StoreError::Encode(e.to_string()),
        other => StoreError::Transient(other.to_string()),
    };
    let class = match &mapped {
        StoreError::NotFound { .. } => "not_found",
        StoreError::Conflict { .. } => "conflict",
        StoreError::Transient(_) => "transient",
        StoreError::Rejected { .. } => "rejected",
        StoreError::Encode(_) => "encode",
    };
    counter!("jsrv_store_errors_total", 1u64, "class" => class);
    mapped
}

/// `ObjectStore` backed by the API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client } }

    fn api<K: Stored>(&self, namespace: &str) -> Api<K> { Api::namespaced(self.client.clone(), namespace) }
}

fn kind_of<K: Stored>() -> String { K::kind(&()).into_owned() }

fn key_of<K: Stored>(obj: &K) -> Result<ObjectKey, StoreError> {
    ObjectKey::of(obj).ok_or_else(|| StoreError::Rejected { code: 422, message: format!("{} {} has no namespace", kind_of::<K>(), obj.name_any()) })
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: Stored>(&self, key: &ObjectKey) -> Result<Option<K>, StoreError> {
        debug!(kind = %kind_of::<K>(), key = %key, "get");
        self.api::<K>(&key.namespace).get_opt(&key.name).await.map_err(|e| map_kube_error(&kind_of::<K>(), key, e))
    }

    async fn create<K: Stored>(&self, obj: &K) -> Result<K, StoreError> {
        let key = key_of(obj)?;
        debug!(kind = %kind_of::<K>(), key = %key, "create");
        self.api::<K>(&key.namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_kube_error(&kind_of::<K>(), &key, e))
    }

    async fn replace<K: Stored>(&self, obj: &K) -> Result<K, StoreError> {
        let key = key_of(obj)?;
        debug!(kind = %kind_of::<K>(), key = %key, rv = ?obj.resource_version(), "replace");
        self.api::<K>(&key.namespace)
            .replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_kube_error(&kind_of::<K>(), &key, e))
    }

    async fn replace_status<K: Stored>(&self, obj: &K) -> Result<K, StoreError> {
        let key = key_of(obj)?;
        debug!(kind = %kind_of::<K>(), key = %key, rv = ?obj.resource_version(), "replace status");
        let body = serde_json::to_vec(obj)?;
        self.api::<K>(&key.namespace)
            .replace_status(&key.name, &PostParams::default(), body)
            .await
            .map_err(|e| map_kube_error(&kind_of::<K>(), &key, e))
    }
}
