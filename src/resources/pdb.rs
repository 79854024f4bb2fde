//! PodDisruptionBudget generation for etcd clusters.
//!
//! Keeps a quorum of members running during voluntary disruptions such as
//! node drains.

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::crd::EtcdCluster;
use crate::resources::common::{owner_reference, pod_selector_labels, standard_labels};

/// Members that may be down while a quorum of `members` survives.
///
/// A single-member (or stopped) cluster has no quorum to protect, so one
/// disruption is allowed rather than blocking drains forever.
pub fn max_unavailable(members: i32) -> i32 {
    if members <= 1 { 1 } else { (members - 1) / 2 }
}

/// Generate a PodDisruptionBudget for an EtcdCluster.
pub fn generate_pod_disruption_budget(resource: &EtcdCluster) -> PodDisruptionBudget {
    PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(resource.name_any()),
            namespace: resource.namespace(),
            labels: Some(standard_labels(resource)),
            owner_references: Some(vec![owner_reference(resource)]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            max_unavailable: Some(IntOrString::Int(max_unavailable(resource.spec.members))),
            selector: Some(LabelSelector {
                match_labels: Some(pod_selector_labels(resource)),
                ..Default::default()
            }),
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

    fn test_resource(name: &str, members: i32) -> EtcdCluster {
        EtcdCluster {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some("test-uid".to_string()),
                ..Default::default()
            },
            spec: EtcdClusterSpec {
                members,
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn test_generate_pdb_3_members() {
        let pdb = generate_pod_disruption_budget(&test_resource("my-etcd", 3));

        assert_eq!(pdb.metadata.name, Some("my-etcd".to_string()));
        let spec = pdb.spec.unwrap();
        assert_eq!(spec.max_unavailable, Some(IntOrString::Int(1)));
    }

    #[test]
    fn test_max_unavailable_keeps_quorum() {
        assert_eq!(max_unavailable(0), 1);
        assert_eq!(max_unavailable(1), 1);
        assert_eq!(max_unavailable(3), 1);
        assert_eq!(max_unavailable(5), 2);
        assert_eq!(max_unavailable(7), 3);
        assert_eq!(max_unavailable(9), 4);
    }

    #[test]
    fn test_pdb_selector() {
        let pdb = generate_pod_disruption_budget(&test_resource("my-etcd", 3));
        let labels = pdb.spec.unwrap().selector.unwrap().match_labels.unwrap();

        assert_eq!(
            labels.get("etcdoperator.smoketurner.com/cluster"),
            Some(&"my-etcd".to_string())
        );
    }
}
