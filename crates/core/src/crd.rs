//! The `JsonServer` custom resource (`example.com/v1`).

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

fn default_replica_count() -> i32 { 1 }

/// Desired state of a JsonServer.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "example.com",
    version = "v1",
    kind = "JsonServer",
    plural = "jsonservers",
    singular = "jsonserver",
    shortname = "jsrv",
    status = "JsonServerStatus",
    namespaced,
    scale = r#"{"specReplicasPath":".spec.replicaCount","statusReplicasPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicaCount"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Message","type":"string","jsonPath":".status.message"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct JsonServerSpec {
    /// Number of json-server pods to run.
    #[serde(default = "default_replica_count")]
    #[schemars(range(min = 1))]
    pub replica_count: i32,

    /// JSON document served by json-server, mounted as `/data/db.json`.
    /// Missing values deserialize as empty so a bad definition still reaches validation.
    #[serde(default)]
    #[schemars(length(min = 1))]
    pub config_payload: String,
}

/// Outcome of the most recent reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum SyncState {
    Synced,
    Error,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Synced => "Synced",
            SyncState::Error => "Error",
        }
    }
}

/// Observed state written by the status reporter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JsonServerStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<SyncState>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Replica count the last pass attempted to apply.
    #[serde(default)]
    pub replicas: i32,
}

pub const SYNCED_MESSAGE: &str = "Synced successfully!";
pub const UNEXPECTED_FAILURE_MESSAGE: &str = "Error: unexpected failure";

impl JsonServerStatus {
    pub fn synced(replicas: i32) -> Self {
        Self { state: Some(SyncState::Synced), message: SYNCED_MESSAGE.to_string(), replicas }
    }

    pub fn error(message: impl Into<String>, replicas: i32) -> Self {
        Self { state: Some(SyncState::Error), message: message.into(), replicas }
    }
}

impl JsonServer {
    /// Replica count as declared, before any validation.
    pub fn declared_replicas(&self) -> i32 { self.spec.replica_count }
}
