//! Progressive membership scaling.
//!
//! Each call to [`step`] moves the StatefulSet replica count by at most one
//! and keeps etcd's member list in agreement with it:
//!
//! - Scale up: a new ordinal is admitted (`MemberAdd`) only once its pod is
//!   addressable, and the next replica is added only once every existing
//!   member is ready.
//! - Scale down: the highest ordinal is removed from etcd before the replica
//!   count drops.
//! - Scale to zero: replicas go straight to 0 with no member calls.
//!
//! Ordinal 0 is the seed. It bootstraps a fresh cluster and never needs an
//! add call.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::client::{MemberInfo, MembershipClient};
use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::controller::status::{is_ordinal_ready, pod_for_ordinal, recorded_member_id};
use crate::crd::EtcdCluster;
use crate::resources::common::{member_name, namespace_of, peer_url};

/// Inputs of one scaling step.
pub struct ScalingInput<'a> {
    pub cluster: &'a EtcdCluster,
    /// StatefulSet replica count (C)
    pub current_replicas: i32,
    /// Desired member count (D)
    pub desired: i32,
    /// Pods selected by the cluster's labels
    pub pods: &'a [Pod],
}

/// What a step did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// C == D and every member is admitted and ready
    Converged,
    /// Nothing changed; waiting on a pod or member
    Waiting(String),
    /// A member entry was added for an ordinal
    MemberAdded { ordinal: i32, id: u64 },
    /// Replicas went up by one
    ScaledUp { replicas: i32 },
    /// The highest member was removed and replicas went down by one
    ScaledDown { replicas: i32 },
    /// Replicas are zero
    Stopped,
}

impl StepOutcome {
    /// Whether the step changed membership or replicas.
    pub fn made_progress(&self) -> bool {
        matches!(
            self,
            StepOutcome::MemberAdded { .. }
                | StepOutcome::ScaledUp { .. }
                | StepOutcome::ScaledDown { .. }
        )
    }
}

/// Result of one scaling step.
#[derive(Clone, Debug)]
pub struct StepReport {
    pub outcome: StepOutcome,
    /// StatefulSet replica count after the step
    pub replicas: i32,
    /// etcd member list as of the end of the step, when etcd was consulted
    pub members: Option<Vec<MemberInfo>>,
}

/// Admission state of the newest ordinal.
#[derive(Debug, PartialEq, Eq)]
enum Admission {
    Admitted,
    NotAddressable,
    Added(u64),
    Pending(String),
}

/// Lazily connected membership view for one step.
struct Membership<'a> {
    ctx: &'a Context,
    cluster: &'a EtcdCluster,
    client: Option<Arc<dyn MembershipClient>>,
    members: Option<Vec<MemberInfo>>,
}

impl<'a> Membership<'a> {
    fn new(ctx: &'a Context, cluster: &'a EtcdCluster) -> Self {
        Self {
            ctx,
            cluster,
            client: None,
            members: None,
        }
    }

    async fn client(&mut self) -> Result<Arc<dyn MembershipClient>> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        let client = self.ctx.membership_client(self.cluster).await?;
        self.client = Some(client.clone());
        Ok(client)
    }

    async fn list(&mut self) -> Result<Vec<MemberInfo>> {
        let members = self.client().await?.list_members().await?;
        self.members = Some(members.clone());
        Ok(members)
    }

    async fn add(&mut self, peer_url: &str) -> Result<MemberInfo> {
        let member = self.client().await?.add_member(peer_url).await?;
        self.ctx.record_membership_change(self.cluster, "add");
        if let Some(members) = self.members.as_mut() {
            members.push(member.clone());
        }
        Ok(member)
    }

    fn into_report(self, outcome: StepOutcome, replicas: i32) -> StepReport {
        StepReport {
            outcome,
            replicas,
            members: self.members,
        }
    }

    /// Remove a member. An already-removed member counts as removed.
    async fn remove(&mut self, id: u64) -> Result<()> {
        match self.client().await?.remove_member(id).await {
            Ok(()) => self.ctx.record_membership_change(self.cluster, "remove"),
            Err(e) if e.is_member_not_found() => {
                debug!(member_id = %format!("{id:x}"), "Member already removed");
            }
            Err(e) => return Err(e.into()),
        }
        if let Some(members) = self.members.as_mut() {
            members.retain(|m| m.id != id);
        }
        Ok(())
    }
}

/// Whether a pod can be reached at its peer URL.
///
/// The pod must exist, must not be terminating and must have an IP. With
/// `publishNotReadyAddresses` on the peer Service, that is when its DNS
/// record resolves.
pub fn is_addressable(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none()
        && pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.as_deref())
            .is_some_and(|ip| !ip.is_empty())
}

/// Whether `members` already holds an entry admitting `ordinal`.
///
/// The entry must advertise the ordinal's peer URL and either carry its name
/// (the member has started) or the ID recorded for it (added, not started).
pub fn is_admitted(
    cluster: &EtcdCluster,
    members: &[MemberInfo],
    ordinal: i32,
    recorded_id: Option<u64>,
) -> bool {
    let name = member_name(cluster, ordinal);
    let peer = peer_url(cluster, ordinal);
    members
        .iter()
        .any(|m| m.has_peer_url(&peer) && (m.name == name || Some(m.id) == recorded_id))
}

async fn admit(
    membership: &mut Membership<'_>,
    cluster: &EtcdCluster,
    pods: &[Pod],
    ordinal: i32,
) -> Result<Admission> {
    if ordinal == 0 {
        return Ok(Admission::Admitted);
    }

    // Probe the pod first so an unreachable member never costs an etcd call.
    if !pod_for_ordinal(cluster, pods, ordinal).is_some_and(is_addressable) {
        return Ok(Admission::NotAddressable);
    }

    let members = membership.list().await?;
    if is_admitted(cluster, &members, ordinal, recorded_member_id(cluster, ordinal)) {
        return Ok(Admission::Admitted);
    }

    let peer = peer_url(cluster, ordinal);
    for stale in members
        .iter()
        .filter(|m| m.is_unstarted() && m.has_peer_url(&peer))
    {
        info!(
            member_id = %stale.id_hex(),
            peer_url = %peer,
            "Removing unstarted member left by an interrupted add"
        );
        membership.remove(stale.id).await?;
    }

    let remaining = membership
        .members
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|m| m.has_peer_url(&peer));
    if remaining {
        return Ok(Admission::Pending(format!(
            "member with peer URL {peer} exists under another name"
        )));
    }

    let added = membership.add(&peer).await?;
    info!(
        member = %member_name(cluster, ordinal),
        member_id = %added.id_hex(),
        "Added etcd member"
    );
    Ok(Admission::Added(added.id))
}

fn waiting_on(cluster: &EtcdCluster, ordinal: i32, admission: &Admission) -> StepOutcome {
    let name = member_name(cluster, ordinal);
    match admission {
        Admission::Added(id) => StepOutcome::MemberAdded { ordinal, id: *id },
        Admission::NotAddressable => StepOutcome::Waiting(format!("{name} is not addressable")),
        Admission::Pending(reason) => StepOutcome::Waiting(format!("{name}: {reason}")),
        Admission::Admitted => StepOutcome::Waiting(format!("{name} is not ready")),
    }
}

/// Run one step of the scaling protocol.
pub async fn step(ctx: &Context, input: ScalingInput<'_>) -> Result<StepReport> {
    let ScalingInput {
        cluster,
        current_replicas: current,
        desired,
        pods,
    } = input;
    let namespace = namespace_of(cluster);
    let name = cluster.name_any();
    let mut membership = Membership::new(ctx, cluster);

    if desired <= 0 {
        if current != 0 {
            info!(from = current, "Scaling to zero members");
            ctx.platform
                .patch_statefulset_replicas(&namespace, &name, 0)
                .await?;
        }
        return Ok(membership.into_report(StepOutcome::Stopped, 0));
    }

    if current > desired {
        let ordinal = current - 1;
        let member = member_name(cluster, ordinal);
        let peer = peer_url(cluster, ordinal);
        let members = membership.list().await?;
        let doomed: Vec<u64> = members
            .iter()
            .filter(|m| m.name == member || m.has_peer_url(&peer))
            .map(|m| m.id)
            .collect();
        if doomed.is_empty() {
            debug!(member = %member, "Member not in etcd, already removed");
        }
        for id in doomed {
            info!(member = %member, member_id = %format!("{id:x}"), "Removing etcd member");
            membership.remove(id).await?;
        }

        ctx.platform
            .patch_statefulset_replicas(&namespace, &name, ordinal)
            .await?;
        info!(from = current, to = ordinal, "Scaled down by one member");
        return Ok(membership.into_report(StepOutcome::ScaledDown { replicas: ordinal }, ordinal));
    }

    // Up path and converged path: the newest ordinal must be admitted first.
    if current > 0 {
        let newest = current - 1;
        let admission = admit(&mut membership, cluster, pods, newest).await?;
        if admission != Admission::Admitted {
            return Ok(membership.into_report(waiting_on(cluster, newest, &admission), current));
        }
    }

    if let Some(not_ready) = (0..current).find(|o| !is_ordinal_ready(cluster, pods, *o)) {
        let outcome =
            StepOutcome::Waiting(format!("{} is not ready", member_name(cluster, not_ready)));
        return Ok(membership.into_report(outcome, current));
    }

    if current == desired {
        return Ok(membership.into_report(StepOutcome::Converged, current));
    }

    let next = current + 1;
    ctx.platform
        .patch_statefulset_replicas(&namespace, &name, next)
        .await?;
    info!(from = current, to = next, "Scaled up by one member");

    // `pods` predates the patch; the new ordinal is admitted as the newest next pass.
    Ok(membership.into_report(StepOutcome::ScaledUp { replicas: next }, next))
}

/// Replica-changing steps needed to move from `current` to `desired`.
pub fn steps_to_converge(current: i32, desired: i32) -> u32 {
    if desired <= 0 {
        u32::from(current != 0)
    } else {
        current.abs_diff(desired)
    }
}
