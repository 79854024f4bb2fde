//! Service generation for etcd clusters.
//!
//! Creates two services:
//! - **Peer Service**: headless, gives each member a stable DNS record
//! - **Client Service**: ClusterIP, load balances client traffic

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::crd::{CLIENT_PORT, EtcdCluster, PEER_PORT};
use crate::resources::common::{
    client_service_name, owner_reference, peer_service_name, pod_selector_labels,
    standard_annotations, standard_labels,
};

fn port(name: &str, number: i32) -> ServicePort {
    ServicePort {
        port: number,
        target_port: Some(IntOrString::String(name.to_string())),
        name: Some(name.to_string()),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn service_metadata(resource: &EtcdCluster, name: String, service_type: &str) -> ObjectMeta {
    let mut labels = standard_labels(resource);
    labels.insert(
        "app.kubernetes.io/service-type".to_string(),
        service_type.to_string(),
    );
    let annotations = standard_annotations(resource);

    ObjectMeta {
        name: Some(name),
        namespace: resource.namespace(),
        labels: Some(labels),
        annotations: if annotations.is_empty() {
            None
        } else {
            Some(annotations)
        },
        owner_references: Some(vec![owner_reference(resource)]),
        ..Default::default()
    }
}

/// Generate the headless peer Service.
///
/// `publishNotReadyAddresses` makes a member's DNS record exist as soon as
/// its pod has an IP, which a joining member needs before it can become ready.
pub fn generate_peer_service(resource: &EtcdCluster) -> Service {
    Service {
        metadata: service_metadata(resource, peer_service_name(resource), "peer"),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(pod_selector_labels(resource)),
            ports: Some(vec![port("client", CLIENT_PORT), port("peer", PEER_PORT)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the client Service.
pub fn generate_client_service(resource: &EtcdCluster) -> Service {
    Service {
        metadata: service_metadata(resource, client_service_name(resource), "client"),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(pod_selector_labels(resource)),
            ports: Some(vec![port("client", CLIENT_PORT)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::get_unwrap
)]
mod tests {
    use super::*;
    use crate::crd::EtcdClusterSpec;

    fn test_resource(name: &str) -> EtcdCluster {
        EtcdCluster {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some("test-uid".to_string()),
                ..Default::default()
            },
            spec: EtcdClusterSpec::default(),
            status: None,
        }
    }

    #[test]
    fn test_peer_service() {
        let svc = generate_peer_service(&test_resource("my-etcd"));
        assert_eq!(svc.metadata.name, Some("my-etcd-peer".to_string()));

        let spec = svc.spec.unwrap();
        assert_eq!(spec.cluster_ip, Some("None".to_string()));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[1].port, 2380);
    }

    #[test]
    fn test_client_service() {
        let svc = generate_client_service(&test_resource("my-etcd"));
        assert_eq!(svc.metadata.name, Some("my-etcd-client".to_string()));

        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_, Some("ClusterIP".to_string()));
        assert_eq!(spec.cluster_ip, None);
        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, 2379);
    }

    #[test]
    fn test_services_select_cluster_pods() {
        let resource = test_resource("my-etcd");
        let selector = generate_client_service(&resource).spec.unwrap().selector.unwrap();
        assert_eq!(selector, pod_selector_labels(&resource));
    }
}
