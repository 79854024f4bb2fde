//! Status management utilities.
//!
//! Holds the one definition of member readiness used everywhere in the
//! controller, the condition upsert rules, and the builders that turn an
//! observation into `EtcdClusterStatus` fields.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::client::MemberInfo;
use crate::client::membership::parse_member_id;
use crate::crd::{ClusterPhase, Condition, EtcdCluster, EtcdClusterStatus, MemberStatus};
use crate::resources::common::{client_service_endpoint, client_url, member_name, peer_url};

/// Builder for managing conditions list.
///
/// Starts from the existing conditions. Setting a condition whose status and
/// reason are unchanged refreshes it in place and keeps `lastTransitionTime`;
/// anything else replaces it.
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
}

impl ConditionBuilder {
    /// Create an empty condition builder
    pub fn new() -> Self {
        Self {
            conditions: Vec::new(),
        }
    }

    /// Start from the conditions currently in status
    pub fn from_existing(conditions: &[Condition]) -> Self {
        Self {
            conditions: conditions.to_vec(),
        }
    }

    /// Add or update a condition
    pub fn set(&mut self, condition: Condition) -> &mut Self {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            Some(existing)
                if existing.status == condition.status && existing.reason == condition.reason =>
            {
                existing.message = condition.message;
                existing.last_update_time = condition.last_update_time;
                existing.observed_generation = condition.observed_generation;
            }
            Some(existing) => *existing = condition,
            None => self.conditions.push(condition),
        }
        self
    }

    /// Set Ready condition
    pub fn ready(
        &mut self,
        ready: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::ready(ready, reason, message, generation))
    }

    /// Set Progressing condition
    pub fn progressing(
        &mut self,
        progressing: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::progressing(
            progressing,
            reason,
            message,
            generation,
        ))
    }

    /// Set Degraded condition
    pub fn degraded(
        &mut self,
        degraded: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::degraded(degraded, reason, message, generation))
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

impl Default for ConditionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Check if a condition type is true
pub fn is_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    conditions
        .iter()
        .find(|c| c.r#type == condition_type)
        .is_some_and(Condition::is_true)
}

/// Get the reason for a condition
pub fn get_condition_reason<'a>(
    conditions: &'a [Condition],
    condition_type: &str,
) -> Option<&'a str> {
    conditions
        .iter()
        .find(|c| c.r#type == condition_type)
        .map(|c| c.reason.as_str())
}

/// Whether a pod reports the `Ready` condition as True.
///
/// This is the only readiness test in the controller.
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// The pod backing an ordinal, if it exists.
pub fn pod_for_ordinal<'a>(
    cluster: &EtcdCluster,
    pods: &'a [Pod],
    ordinal: i32,
) -> Option<&'a Pod> {
    let name = member_name(cluster, ordinal);
    pods.iter().find(|p| p.name_any() == name)
}

/// Whether the pod of an ordinal exists and is ready.
pub fn is_ordinal_ready(cluster: &EtcdCluster, pods: &[Pod], ordinal: i32) -> bool {
    pod_for_ordinal(cluster, pods, ordinal).is_some_and(is_pod_ready)
}

/// Number of ordinals in `0..replicas` whose pod is ready.
pub fn ready_member_count(cluster: &EtcdCluster, pods: &[Pod], replicas: i32) -> i32 {
    let ready = (0..replicas)
        .filter(|ordinal| is_ordinal_ready(cluster, pods, *ordinal))
        .count();
    i32::try_from(ready).unwrap_or(i32::MAX)
}

/// Member records for ordinals in `0..replicas`.
///
/// With an admin list, an ordinal is recorded only when the list holds an
/// entry with its peer URL, and the entry's ID is recorded with it. Without
/// one (etcd was not consulted this pass), the previously recorded entries
/// for surviving ordinals are carried over with refreshed readiness.
pub fn member_records(
    cluster: &EtcdCluster,
    replicas: i32,
    pods: &[Pod],
    admin: Option<&[MemberInfo]>,
) -> Vec<MemberStatus> {
    let previous = cluster
        .status
        .as_ref()
        .map(|s| s.members.as_slice())
        .unwrap_or_default();

    (0..replicas)
        .filter_map(|ordinal| {
            let name = member_name(cluster, ordinal);
            let peer = peer_url(cluster, ordinal);
            let id = match admin {
                Some(members) => Some(members.iter().find(|m| m.has_peer_url(&peer))?.id_hex()),
                None => previous.iter().find(|m| m.name == name)?.id.clone(),
            };
            Some(MemberStatus {
                ready: is_ordinal_ready(cluster, pods, ordinal),
                client_url: client_url(cluster, ordinal),
                peer_url: peer,
                name,
                id,
            })
        })
        .collect()
}

/// Member ID recorded in status for an ordinal.
pub fn recorded_member_id(cluster: &EtcdCluster, ordinal: i32) -> Option<u64> {
    let name = member_name(cluster, ordinal);
    cluster
        .status
        .as_ref()?
        .members
        .iter()
        .find(|m| m.name == name)?
        .id
        .as_deref()
        .and_then(parse_member_id)
}

/// Whether two statuses differ in anything but their timestamps.
pub fn status_changed(old: &EtcdClusterStatus, new: &EtcdClusterStatus) -> bool {
    fn normalized(status: &EtcdClusterStatus) -> serde_json::Value {
        let mut status = status.clone();
        status.last_update_time = None;
        for condition in &mut status.conditions {
            condition.last_update_time = None;
            condition.last_transition_time.clear();
        }
        serde_json::to_value(status).unwrap_or_default()
    }
    normalized(old) != normalized(new)
}

/// Observed state a status is built from.
pub struct StatusInput<'a> {
    pub phase: ClusterPhase,
    /// StatefulSet replica count
    pub replicas: i32,
    pub pods: &'a [Pod],
    /// etcd member list, when etcd was consulted this pass
    pub admin_members: Option<&'a [MemberInfo]>,
    /// Progress message from the phase handler
    pub message: Option<&'a str>,
    /// Terminal failure as (reason, message)
    pub failure: Option<(&'a str, &'a str)>,
}

/// Build the next status of a cluster from the previous one and an observation.
pub fn build_status(cluster: &EtcdCluster, input: StatusInput<'_>) -> EtcdClusterStatus {
    let previous = cluster.status.clone().unwrap_or_default();
    let generation = cluster.metadata.generation;
    let desired = cluster.spec.members;
    let ready = ready_member_count(cluster, input.pods, input.replicas);
    let progress = format!("{ready}/{desired} members ready");
    let message = input.message.unwrap_or(&progress);

    let mut conditions = ConditionBuilder::from_existing(&previous.conditions);
    match (input.phase, input.failure) {
        (ClusterPhase::Failed, Some((reason, failure_message))) => {
            conditions
                .ready(false, reason, failure_message, generation)
                .degraded(true, reason, failure_message, generation)
                .progressing(false, reason, failure_message, generation);
        }
        (ClusterPhase::Failed, None) => {
            conditions.progressing(false, "Recovering", message, generation);
        }
        (ClusterPhase::Running, _) => {
            conditions
                .ready(true, "AllMembersReady", &progress, generation)
                .progressing(false, "Converged", &progress, generation)
                .degraded(false, "Healthy", &progress, generation);
        }
        (ClusterPhase::Stopped, _) => {
            let stopped = "Cluster scaled to zero members";
            conditions
                .ready(false, "Stopped", stopped, generation)
                .progressing(false, "Stopped", stopped, generation)
                .degraded(true, "Stopped", stopped, generation);
        }
        (ClusterPhase::Uninitialized, _) => {
            conditions.progressing(true, "Initializing", message, generation);
        }
        (phase, _) => {
            let reason = phase.as_str();
            conditions
                .ready(false, reason, &progress, generation)
                .progressing(true, reason, message, generation);
            if phase != ClusterPhase::Deleting {
                conditions.degraded(false, reason, &progress, generation);
            }
        }
    }

    let current_version = if input.phase == ClusterPhase::Running {
        Some(cluster.spec.version.clone())
    } else {
        previous.current_version.clone()
    };

    EtcdClusterStatus {
        phase: input.phase,
        ready_members: ready,
        current_replicas: input.replicas,
        members: member_records(cluster, input.replicas, input.pods, input.admin_members),
        conditions: conditions.build(),
        client_endpoints: vec![client_service_endpoint(cluster)],
        last_update_time: Some(jiff::Timestamp::now().to_string()),
        observed_generation: generation,
        current_version,
    }
}
