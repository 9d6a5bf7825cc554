//! Deterministic names, labels and fixed values for the dependent artifacts.
//!
//! Everything here is a function of the definition's name (and namespace) only.

use std::collections::BTreeMap;

/// Required prefix of every JsonServer name.
pub const NAME_PREFIX: &str = "app-";

pub const MANAGED_BY: &str = "jsonserver-controller";
pub const SERVER_IMAGE: &str = "backplane/json-server";
pub const CONTAINER_NAME: &str = "json-server";
pub const CONFIG_KEY: &str = "db.json";
pub const CONFIG_VOLUME: &str = "json-config";
pub const CONFIG_MOUNT_PATH: &str = "/data";
pub const HTTP_PORT_NAME: &str = "http";
pub const HTTP_PORT: i32 = 3000;

pub const LABEL_APP: &str = "app";
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

pub fn config_map_name(definition: &str) -> String { format!("{definition}-config") }

pub fn deployment_name(definition: &str) -> String { definition.to_string() }

pub fn service_name(definition: &str) -> String { definition.to_string() }

/// Path json-server is started with; the config map key under the mount.
pub fn config_file_path() -> String { format!("{CONFIG_MOUNT_PATH}/{CONFIG_KEY}") }

/// Selector shared by the workload's pods and the service.
pub fn selector_labels(definition: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_APP.to_string(), definition.to_string())])
}

/// Labels stamped on every artifact: the selector plus owner/manager identification.
pub fn common_labels(definition: &str) -> BTreeMap<String, String> {
    let mut labels = selector_labels(definition);
    labels.insert(LABEL_NAME.to_string(), definition.to_string());
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
    labels
}
