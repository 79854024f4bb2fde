//! EtcdCluster Custom Resource Definition.
//!
//! Defines the EtcdCluster CRD for deploying and managing etcd clusters
//! on Kubernetes. The controller owns the status; users only edit the spec.

use std::collections::BTreeMap;
use std::str::FromStr;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};

/// API group for the EtcdCluster resource.
pub const API_GROUP: &str = "etcdoperator.smoketurner.com";

/// API version for the EtcdCluster resource.
pub const API_VERSION: &str = "v1alpha1";

/// Finalizer that guards deletion until cleanup has run.
pub const FINALIZER: &str = "etcdoperator.smoketurner.com/finalizer";

/// etcd client port.
pub const CLIENT_PORT: i32 = 2379;

/// etcd peer (raft) port.
pub const PEER_PORT: i32 = 2380;

/// Largest member count the operator will manage.
pub const MAX_MEMBERS: i32 = 9;

/// EtcdCluster is a custom resource for deploying etcd clusters.
///
/// Example:
/// ```yaml
/// apiVersion: etcdoperator.smoketurner.com/v1alpha1
/// kind: EtcdCluster
/// metadata:
///   name: my-etcd
/// spec:
///   members: 3
///   version: "3.5.17"
///   storage:
///     size: 2Gi
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "etcdoperator.smoketurner.com",
    version = "v1alpha1",
    kind = "EtcdCluster",
    plural = "etcdclusters",
    shortname = "etcd",
    status = "EtcdClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Members", "type":"integer", "jsonPath":".spec.members"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyMembers"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EtcdClusterSpec {
    /// Number of voting members (0-9, odd when greater than 1).
    /// Zero stops the cluster while keeping the resource.
    #[serde(default = "default_members")]
    pub members: i32,

    /// etcd version in semver form (e.g. 3.5.17). The image tag is `v<version>`.
    #[serde(default = "default_version")]
    pub version: String,

    /// Container image repository (default: quay.io/coreos/etcd).
    #[serde(default = "default_repository")]
    pub repository: String,

    /// Persistent storage for each member's data directory.
    #[serde(default)]
    pub storage: StorageSpec,

    /// Resource requests and limits for etcd pods.
    #[serde(default)]
    pub resources: ResourceRequirementsSpec,

    /// Additional labels to apply to all managed resources.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Additional annotations to apply to all managed resources.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl Default for EtcdClusterSpec {
    fn default() -> Self {
        Self {
            members: default_members(),
            version: default_version(),
            repository: default_repository(),
            storage: StorageSpec::default(),
            resources: ResourceRequirementsSpec::default(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }
}

fn default_members() -> i32 {
    3
}

fn default_version() -> String {
    "3.5.17".to_string()
}

fn default_repository() -> String {
    "quay.io/coreos/etcd".to_string()
}

/// Storage configuration for member data.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Size of each member's PersistentVolumeClaim (default: 1Gi).
    #[serde(default = "default_storage_size")]
    pub size: String,

    /// Storage class name. Uses the cluster default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// What happens to the PersistentVolumeClaims when the cluster is deleted.
    #[serde(default)]
    pub reclaim_policy: ReclaimPolicy,
}

impl Default for StorageSpec {
    fn default() -> Self {
        Self {
            size: default_storage_size(),
            storage_class_name: None,
            reclaim_policy: ReclaimPolicy::default(),
        }
    }
}

fn default_storage_size() -> String {
    "1Gi".to_string()
}

/// Fate of member volumes when the EtcdCluster is deleted.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum ReclaimPolicy {
    /// Keep the PersistentVolumeClaims.
    #[default]
    Retain,
    /// Delete the PersistentVolumeClaims once the cluster is removed.
    Delete,
}

impl ReclaimPolicy {
    /// Value used for the StatefulSet `persistentVolumeClaimRetentionPolicy`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReclaimPolicy::Retain => "Retain",
            ReclaimPolicy::Delete => "Delete",
        }
    }
}

/// Resource requests and limits for etcd pods.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirementsSpec {
    /// CPU and memory requests.
    #[serde(default)]
    pub requests: ResourceSpec,

    /// CPU and memory limits.
    #[serde(default)]
    pub limits: ResourceLimitsSpec,
}

/// Resource requests specification.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    /// CPU request (default: 100m).
    #[serde(default = "default_cpu_request")]
    pub cpu: String,

    /// Memory request (default: 256Mi).
    #[serde(default = "default_memory_request")]
    pub memory: String,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            cpu: default_cpu_request(),
            memory: default_memory_request(),
        }
    }
}

fn default_cpu_request() -> String {
    "100m".to_string()
}

fn default_memory_request() -> String {
    "256Mi".to_string()
}

/// Resource limits specification.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimitsSpec {
    /// CPU limit (default: 1).
    #[serde(default = "default_cpu_limit")]
    pub cpu: String,

    /// Memory limit (default: 1Gi).
    #[serde(default = "default_memory_limit")]
    pub memory: String,
}

impl Default for ResourceLimitsSpec {
    fn default() -> Self {
        Self {
            cpu: default_cpu_limit(),
            memory: default_memory_limit(),
        }
    }
}

fn default_cpu_limit() -> String {
    "1".to_string()
}

fn default_memory_limit() -> String {
    "1Gi".to_string()
}

/// Status of an EtcdCluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EtcdClusterStatus {
    /// Current phase of the cluster lifecycle.
    #[serde(default, deserialize_with = "deserialize_phase_lenient")]
    #[schemars(with = "ClusterPhase")]
    pub phase: ClusterPhase,

    /// Number of members whose pod reports Ready.
    #[serde(default)]
    pub ready_members: i32,

    /// StatefulSet replica count as last observed.
    #[serde(default)]
    pub current_replicas: i32,

    /// Per-ordinal member records.
    #[serde(default)]
    pub members: Vec<MemberStatus>,

    /// Conditions describing the current state.
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Client endpoints (e.g. "http://my-etcd-client.ns.svc:2379").
    #[serde(default)]
    pub client_endpoints: Vec<String>,

    /// Time of the last status write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,

    /// The generation most recently observed by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// etcd version running in the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,
}

/// One voting member, keyed by its StatefulSet ordinal.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    /// Pod name (`<cluster>-<ordinal>`).
    pub name: String,
    /// Peer URL advertised to the other members.
    pub peer_url: String,
    /// Client URL of this member.
    pub client_url: String,
    /// Whether the member's pod is Ready.
    pub ready: bool,
    /// etcd member ID in hex. Absent until the member is admitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// ClusterPhase represents the current lifecycle phase of an EtcdCluster.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ClusterPhase {
    /// Nothing has been validated or created yet.
    #[default]
    Uninitialized,
    /// Child resources are being created and the seed member is starting.
    Creating,
    /// All desired members are admitted and ready.
    Running,
    /// Membership is changing one member at a time.
    Scaling,
    /// The cluster was scaled to zero members.
    Stopped,
    /// Validation or health checks failed.
    Failed,
    /// The cluster is being deleted.
    Deleting,
}

impl ClusterPhase {
    /// All phases, in declaration order.
    pub const ALL: [ClusterPhase; 7] = [
        ClusterPhase::Uninitialized,
        ClusterPhase::Creating,
        ClusterPhase::Running,
        ClusterPhase::Scaling,
        ClusterPhase::Stopped,
        ClusterPhase::Failed,
        ClusterPhase::Deleting,
    ];

    /// Phase name as written to the status subresource.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterPhase::Uninitialized => "Uninitialized",
            ClusterPhase::Creating => "Creating",
            ClusterPhase::Running => "Running",
            ClusterPhase::Scaling => "Scaling",
            ClusterPhase::Stopped => "Stopped",
            ClusterPhase::Failed => "Failed",
            ClusterPhase::Deleting => "Deleting",
        }
    }
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a phase string is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown cluster phase: {0}")]
pub struct UnknownPhase(pub String);

impl FromStr for ClusterPhase {
    type Err = UnknownPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ClusterPhase::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownPhase(s.to_string()))
    }
}

/// Unknown or corrupt phase values fall back to `Uninitialized`.
fn deserialize_phase_lenient<'de, D>(deserializer: D) -> Result<ClusterPhase, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw
        .as_ref()
        .and_then(serde_json::Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or_default())
}

/// Condition describes the state of a cluster at a certain point.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
    /// Last time the condition was refreshed without a transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
    /// The generation of the resource this condition was observed for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition.
    pub fn new(
        condition_type: &str,
        status: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        let now = jiff::Timestamp::now().to_string();
        Self {
            r#type: condition_type.to_string(),
            status: if status {
                "True".to_string()
            } else {
                "False".to_string()
            },
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: now.clone(),
            last_update_time: Some(now),
            observed_generation: generation,
        }
    }

    /// Create a "Ready" condition.
    pub fn ready(ready: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new(ConditionType::Ready.as_str(), ready, reason, message, generation)
    }

    /// Create a "Progressing" condition.
    pub fn progressing(
        progressing: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self::new(
            ConditionType::Progressing.as_str(),
            progressing,
            reason,
            message,
            generation,
        )
    }

    /// Create a "Degraded" condition.
    pub fn degraded(degraded: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new(
            ConditionType::Degraded.as_str(),
            degraded,
            reason,
            message,
            generation,
        )
    }

    /// Whether the status is "True".
    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Types of conditions for EtcdCluster.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionType {
    /// All desired members are admitted and ready.
    Ready,
    /// A lifecycle operation is in progress.
    Progressing,
    /// The cluster is stopped or below its desired size.
    Degraded,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::Ready => "Ready",
            ConditionType::Progressing => "Progressing",
            ConditionType::Degraded => "Degraded",
        }
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
