//! StatefulSet generation for etcd clusters.
//!
//! Creates a StatefulSet with:
//! - Stable network identity via the peer (headless) service
//! - One PVC per member, deleted when the member is scaled away
//! - Bootstrap script mounted from the cluster ConfigMap
//! - HTTP readiness on the member's serializable health endpoint
//!
//! The replica count is an input. The scaling protocol owns it; the builder
//! never derives it from the spec.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    StatefulSet, StatefulSetPersistentVolumeClaimRetentionPolicy, StatefulSetSpec,
    StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMapVolumeSource, Container, ContainerPort, HTTPGetAction,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSecurityContext, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, SeccompProfile, SecurityContext, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::crd::{CLIENT_PORT, EtcdCluster, PEER_PORT};
use crate::resources::common::{
    CONFIG_HASH_ANNOTATION, configmap_name, owner_reference, peer_service_name,
    pod_selector_labels, standard_annotations, standard_labels,
};
use crate::resources::configmap::{BOOTSTRAP_SCRIPT_KEY, CONFIG_MOUNT_PATH, DATA_DIR};

/// Name of the member container.
pub const CONTAINER_NAME: &str = "etcd";

/// Name of the data volume and its claim template.
pub const DATA_VOLUME: &str = "data";

const CONFIG_VOLUME: &str = "config";
const TERMINATION_GRACE_PERIOD: i64 = 30;
const HEALTH_PATH: &str = "/health?serializable=true";

/// Container image for the cluster's version.
pub fn image_for(resource: &EtcdCluster) -> String {
    format!("{}:v{}", resource.spec.repository, resource.spec.version)
}

/// Generate a StatefulSet for an EtcdCluster.
pub fn generate_statefulset(
    resource: &EtcdCluster,
    replicas: i32,
    config_hash: &str,
) -> StatefulSet {
    let labels = standard_labels(resource);
    let annotations = standard_annotations(resource);

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(resource.name_any()),
            namespace: resource.namespace(),
            labels: Some(labels.clone()),
            annotations: if annotations.is_empty() {
                None
            } else {
                Some(annotations.clone())
            },
            owner_references: Some(vec![owner_reference(resource)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            service_name: Some(peer_service_name(resource)),
            selector: LabelSelector {
                match_labels: Some(pod_selector_labels(resource)),
                ..Default::default()
            },
            pod_management_policy: Some("Parallel".to_string()),
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..Default::default()
            }),
            // A removed member's volume must never be reused by a later member
            // at the same ordinal.
            persistent_volume_claim_retention_policy: Some(
                StatefulSetPersistentVolumeClaimRetentionPolicy {
                    when_scaled: Some("Delete".to_string()),
                    when_deleted: Some(resource.spec.storage.reclaim_policy.as_str().to_string()),
                },
            ),
            template: generate_pod_template(resource, labels, annotations, config_hash),
            volume_claim_templates: Some(vec![generate_pvc_template(resource)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn generate_pod_template(
    resource: &EtcdCluster,
    labels: BTreeMap<String, String>,
    mut annotations: BTreeMap<String, String>,
    config_hash: &str,
) -> PodTemplateSpec {
    annotations.insert(CONFIG_HASH_ANNOTATION.to_string(), config_hash.to_string());

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            termination_grace_period_seconds: Some(TERMINATION_GRACE_PERIOD),
            security_context: Some(PodSecurityContext {
                seccomp_profile: Some(SeccompProfile {
                    type_: "RuntimeDefault".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            containers: vec![generate_etcd_container(resource)],
            volumes: Some(vec![Volume {
                name: CONFIG_VOLUME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: configmap_name(resource),
                    default_mode: Some(0o755),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

fn generate_etcd_container(resource: &EtcdCluster) -> Container {
    Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(image_for(resource)),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec![
            "/bin/sh".to_string(),
            format!("{}/{}", CONFIG_MOUNT_PATH, BOOTSTRAP_SCRIPT_KEY),
        ]),
        ports: Some(vec![
            ContainerPort {
                container_port: CLIENT_PORT,
                name: Some("client".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                container_port: PEER_PORT,
                name: Some("peer".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ]),
        resources: Some(generate_resource_requirements(resource)),
        volume_mounts: Some(vec![
            VolumeMount {
                name: DATA_VOLUME.to_string(),
                mount_path: DATA_DIR.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: CONFIG_VOLUME.to_string(),
                mount_path: CONFIG_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        startup_probe: Some(health_probe(5, 60)),
        liveness_probe: Some(health_probe(10, 3)),
        readiness_probe: Some(health_probe(5, 3)),
        ..Default::default()
    }
}

/// Probe against the member's local health endpoint. Serializable reads keep
/// a member that has lost quorum from failing its liveness check.
fn health_probe(period_seconds: i32, failure_threshold: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(HEALTH_PATH.to_string()),
            port: IntOrString::Int(CLIENT_PORT),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        period_seconds: Some(period_seconds),
        timeout_seconds: Some(5),
        failure_threshold: Some(failure_threshold),
        ..Default::default()
    }
}

fn generate_resource_requirements(resource: &EtcdCluster) -> ResourceRequirements {
    let spec = &resource.spec.resources;
    ResourceRequirements {
        limits: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(spec.limits.cpu.clone())),
            ("memory".to_string(), Quantity(spec.limits.memory.clone())),
        ])),
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(spec.requests.cpu.clone())),
            ("memory".to_string(), Quantity(spec.requests.memory.clone())),
        ])),
        ..Default::default()
    }
}

/// Generate PVC template for the StatefulSet.
fn generate_pvc_template(resource: &EtcdCluster) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME.to_string()),
            labels: Some(pod_selector_labels(resource)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: resource.spec.storage.storage_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(resource.spec.storage.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Container of the member pod template, if present.
pub fn etcd_container(sts: &StatefulSet) -> Option<&Container> {
    sts.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == CONTAINER_NAME)
}

/// Config hash stamped on the pod template, if present.
pub fn template_config_hash(sts: &StatefulSet) -> Option<&str> {
    sts.spec
        .as_ref()?
        .template
        .metadata
        .as_ref()?
        .annotations
        .as_ref()?
        .get(CONFIG_HASH_ANNOTATION)
        .map(String::as_str)
}
