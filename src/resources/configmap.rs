//! ConfigMap generation for etcd clusters.
//!
//! Holds the member bootstrap script. Each pod derives its ordinal from its
//! hostname; ordinal 0 seeds a new cluster and every other ordinal joins the
//! existing one with an initial-cluster list covering ordinals `0..=self`.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use sha2::{Digest, Sha256};

use crate::crd::{CLIENT_PORT, EtcdCluster, PEER_PORT};
use crate::resources::common::{
    configmap_name, namespace_of, owner_reference, peer_service_name, standard_annotations,
    standard_labels,
};

/// Key of the bootstrap script in the ConfigMap.
pub const BOOTSTRAP_SCRIPT_KEY: &str = "bootstrap.sh";

/// Mount path of the ConfigMap inside the member container.
pub const CONFIG_MOUNT_PATH: &str = "/etc/etcd-operator";

/// Data directory of a member.
pub const DATA_DIR: &str = "/var/lib/etcd";

const BOOTSTRAP_BODY: &str = r#"
ORDINAL="${HOSTNAME##*-}"
SELF_HOST="${HOSTNAME}.${PEER_SERVICE}.${NAMESPACE}.svc"

INITIAL_CLUSTER=""
i=0
while [ "$i" -le "$ORDINAL" ]; do
  MEMBER="${CLUSTER_NAME}-${i}"
  ENTRY="${MEMBER}=http://${MEMBER}.${PEER_SERVICE}.${NAMESPACE}.svc:${PEER_PORT}"
  INITIAL_CLUSTER="${INITIAL_CLUSTER:+${INITIAL_CLUSTER},}${ENTRY}"
  i=$((i + 1))
done

if [ "$ORDINAL" -eq 0 ]; then
  CLUSTER_STATE=new
else
  CLUSTER_STATE=existing
fi

exec etcd \
  --name "${HOSTNAME}" \
  --data-dir "${DATA_DIR}" \
  --listen-peer-urls "http://0.0.0.0:${PEER_PORT}" \
  --listen-client-urls "http://0.0.0.0:${CLIENT_PORT}" \
  --initial-advertise-peer-urls "http://${SELF_HOST}:${PEER_PORT}" \
  --advertise-client-urls "http://${SELF_HOST}:${CLIENT_PORT}" \
  --initial-cluster-token "${CLUSTER_TOKEN}" \
  --initial-cluster "${INITIAL_CLUSTER}" \
  --initial-cluster-state "${CLUSTER_STATE}"
"#;

/// Render the bootstrap script for a cluster.
pub fn bootstrap_script(resource: &EtcdCluster) -> String {
    let name = resource.name_any();
    let header = [
        "#!/bin/sh".to_string(),
        "set -eu".to_string(),
        format!("CLUSTER_NAME=\"{}\"", name),
        format!("NAMESPACE=\"{}\"", namespace_of(resource)),
        format!("PEER_SERVICE=\"{}\"", peer_service_name(resource)),
        format!("CLUSTER_TOKEN=\"{}\"", cluster_token(resource)),
        format!("CLIENT_PORT={}", CLIENT_PORT),
        format!("PEER_PORT={}", PEER_PORT),
        format!("DATA_DIR=\"{}\"", DATA_DIR),
    ];
    format!("{}\n{}", header.join("\n"), BOOTSTRAP_BODY)
}

/// Initial cluster token. Distinct per cluster name and namespace.
fn cluster_token(resource: &EtcdCluster) -> String {
    format!("{}-{}", namespace_of(resource), resource.name_any())
}

/// Generate the ConfigMap for an EtcdCluster.
pub fn generate_configmap(resource: &EtcdCluster) -> ConfigMap {
    let annotations = standard_annotations(resource);
    let mut data = BTreeMap::new();
    data.insert(BOOTSTRAP_SCRIPT_KEY.to_string(), bootstrap_script(resource));

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(configmap_name(resource)),
            namespace: resource.namespace(),
            labels: Some(standard_labels(resource)),
            annotations: if annotations.is_empty() {
                None
            } else {
                Some(annotations)
            },
            owner_references: Some(vec![owner_reference(resource)]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// Hash of the ConfigMap data, stamped on the pod template so a config
/// change rolls the members.
pub fn config_hash(configmap: &ConfigMap) -> String {
    let mut hasher = Sha256::new();
    if let Some(data) = &configmap.data {
        for (key, value) in data {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        }
    }
    format!("{:x}", hasher.finalize())
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
    fn test_generate_configmap() {
        let cm = generate_configmap(&test_resource("my-etcd"));
        assert_eq!(cm.metadata.name, Some("my-etcd-config".to_string()));
        let data = cm.data.unwrap();
        let script = data.get(BOOTSTRAP_SCRIPT_KEY).unwrap();
        assert!(script.starts_with("#!/bin/sh"));
        assert!(script.contains("CLUSTER_NAME=\"my-etcd\""));
        assert!(script.contains("PEER_SERVICE=\"my-etcd-peer\""));
        assert!(script.contains("--initial-cluster-state"));
    }

    #[test]
    fn test_seed_ordinal_starts_new_cluster() {
        let script = bootstrap_script(&test_resource("my-etcd"));
        assert!(script.contains("if [ \"$ORDINAL\" -eq 0 ]; then\n  CLUSTER_STATE=new"));
        assert!(script.contains("CLUSTER_STATE=existing"));
    }

    #[test]
    fn test_config_hash_is_stable() {
        let a = generate_configmap(&test_resource("my-etcd"));
        let b = generate_configmap(&test_resource("my-etcd"));
        assert_eq!(config_hash(&a), config_hash(&b));
        assert_eq!(config_hash(&a).len(), 64);
    }

    #[test]
    fn test_config_hash_changes_with_cluster() {
        let a = generate_configmap(&test_resource("my-etcd"));
        let b = generate_configmap(&test_resource("other-etcd"));
        assert_ne!(config_hash(&a), config_hash(&b));
    }
}
