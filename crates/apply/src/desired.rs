//! Desired shapes of the three artifacts owned by a JsonServer.
//!
//! Pure functions of the definition. Owner references are added by the
//! applier, not here.

use jsrv_core::naming::{self, CONFIG_KEY, CONFIG_MOUNT_PATH, CONFIG_VOLUME, CONTAINER_NAME, HTTP_PORT, HTTP_PORT_NAME, SERVER_IMAGE};
use jsrv_core::JsonServer;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;

fn meta(js: &JsonServer, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: js.namespace(),
        labels: Some(naming::common_labels(&js.name_any())),
        ..Default::default()
    }
}

/// ConfigMap `<name>-config` holding the raw payload under `db.json`.
pub fn config_map(js: &JsonServer) -> ConfigMap {
    let name = js.name_any();
    ConfigMap {
        metadata: meta(js, naming::config_map_name(&name)),
        data: Some(BTreeMap::from([(CONFIG_KEY.to_string(), js.spec.config_payload.clone())])),
        ..Default::default()
    }
}

/// Deployment `<name>` running json-server against the mounted config map.
pub fn deployment(js: &JsonServer) -> Deployment {
    let name = js.name_any();
    let selector = naming::selector_labels(&name);
    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(SERVER_IMAGE.to_string()),
        args: Some(vec![naming::config_file_path()]),
        ports: Some(vec![ContainerPort {
            container_port: HTTP_PORT,
            name: Some(HTTP_PORT_NAME.to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![VolumeMount {
            name: CONFIG_VOLUME.to_string(),
            mount_path: CONFIG_MOUNT_PATH.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };
    Deployment {
        metadata: meta(js, naming::deployment_name(&name)),
        spec: Some(DeploymentSpec {
            replicas: Some(js.spec.replica_count),
            selector: LabelSelector { match_labels: Some(selector.clone()), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(selector), ..Default::default() }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: CONFIG_VOLUME.to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: Some(naming::config_map_name(&name)),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// ClusterIP Service `<name>` exposing port 3000 on the workload's pods.
pub fn service(js: &JsonServer) -> Service {
    let name = js.name_any();
    Service {
        metadata: meta(js, naming::service_name(&name)),
        spec: Some(ServiceSpec {
            selector: Some(naming::selector_labels(&name)),
            ports: Some(vec![ServicePort {
                name: Some(HTTP_PORT_NAME.to_string()),
                port: HTTP_PORT,
                target_port: Some(IntOrString::Int(HTTP_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
