//! Common resource generation utilities.
//!
//! Naming, labels, owner references and member addressing shared by every
//! child resource of an `EtcdCluster`.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::crd::{API_GROUP, API_VERSION, CLIENT_PORT, EtcdCluster, PEER_PORT};

/// Label carrying the owning cluster's name.
pub const CLUSTER_LABEL: &str = "etcdoperator.smoketurner.com/cluster";

/// Pod template annotation holding a hash of the rendered configuration.
pub const CONFIG_HASH_ANNOTATION: &str = "etcdoperator.smoketurner.com/config-hash";

/// Standard labels applied to all managed resources
pub fn standard_labels(resource: &EtcdCluster) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/name".to_string(), "etcd".to_string());
    labels.insert(
        "app.kubernetes.io/instance".to_string(),
        resource.name_any(),
    );
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "etcd-operator".to_string(),
    );
    labels.insert(
        "app.kubernetes.io/component".to_string(),
        "etcd".to_string(),
    );
    labels.insert(CLUSTER_LABEL.to_string(), resource.name_any());

    // Merge user-defined labels
    for (key, value) in &resource.spec.labels {
        labels.insert(key.clone(), value.clone());
    }

    labels
}

/// Labels used to select the cluster's pods (and PVCs).
pub fn pod_selector_labels(resource: &EtcdCluster) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/name".to_string(), "etcd".to_string());
    labels.insert(CLUSTER_LABEL.to_string(), resource.name_any());
    labels
}

/// Label selector string for list calls.
pub fn pod_selector(resource: &EtcdCluster) -> String {
    pod_selector_labels(resource)
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// User-defined annotations copied to child resources.
pub fn standard_annotations(resource: &EtcdCluster) -> BTreeMap<String, String> {
    resource.spec.annotations.clone()
}

/// Create owner reference for an EtcdCluster
pub fn owner_reference(resource: &EtcdCluster) -> OwnerReference {
    OwnerReference {
        api_version: format!("{}/{}", API_GROUP, API_VERSION),
        kind: "EtcdCluster".to_string(),
        name: resource.name_any(),
        uid: resource.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Namespace of the cluster, falling back to `default`.
pub fn namespace_of(resource: &EtcdCluster) -> String {
    resource
        .namespace()
        .unwrap_or_else(|| "default".to_string())
}

/// Headless service giving each member a stable DNS record.
pub fn peer_service_name(resource: &EtcdCluster) -> String {
    format!("{}-peer", resource.name_any())
}

/// ClusterIP service clients connect through.
pub fn client_service_name(resource: &EtcdCluster) -> String {
    format!("{}-client", resource.name_any())
}

pub fn configmap_name(resource: &EtcdCluster) -> String {
    format!("{}-config", resource.name_any())
}

/// Member (and pod) name for an ordinal.
pub fn member_name(resource: &EtcdCluster, ordinal: i32) -> String {
    format!("{}-{}", resource.name_any(), ordinal)
}

/// Stable DNS name of a member.
pub fn member_host(resource: &EtcdCluster, ordinal: i32) -> String {
    format!(
        "{}.{}.{}.svc",
        member_name(resource, ordinal),
        peer_service_name(resource),
        namespace_of(resource)
    )
}

/// Peer URL advertised by a member.
pub fn peer_url(resource: &EtcdCluster, ordinal: i32) -> String {
    format!("http://{}:{}", member_host(resource, ordinal), PEER_PORT)
}

/// Client URL advertised by a member.
pub fn client_url(resource: &EtcdCluster, ordinal: i32) -> String {
    format!("http://{}:{}", member_host(resource, ordinal), CLIENT_PORT)
}

/// Endpoint of the client service.
pub fn client_service_endpoint(resource: &EtcdCluster) -> String {
    format!(
        "http://{}.{}.svc:{}",
        client_service_name(resource),
        namespace_of(resource),
        CLIENT_PORT
    )
}

/// Extract the ordinal from a member or pod name (`<cluster>-<n>`).
pub fn ordinal_from_name(cluster: &str, name: &str) -> Option<i32> {
    name.strip_prefix(cluster)?
        .strip_prefix('-')?
        .parse::<i32>()
        .ok()
        .filter(|n| *n >= 0)
}
