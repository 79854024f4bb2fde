//! Phase handlers for EtcdCluster reconciliation.
//!
//! This module contains isolated, testable handlers for each phase
//! of the EtcdCluster lifecycle. Each handler does the work of one pass in
//! its phase and returns the phase to move to, together with the event that
//! justifies the move.

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::client::MemberInfo;
use crate::config::OperatorConfig;
use crate::controller::cluster_state_machine::ClusterEvent;
use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::controller::resource_reconciler::ensure_all;
use crate::controller::scaling::{self, ScalingInput, StepOutcome, StepReport};
use crate::controller::status::ready_member_count;
use crate::crd::{ClusterPhase, EtcdCluster};
use crate::resources::common::{client_url, member_name, namespace_of, pod_selector};

/// Condition reason used when child resources cannot be reconciled.
pub const RESOURCE_ERROR_REASON: &str = "ResourceError";

/// Condition reason used when a quorum of members fails the health check.
pub const UNHEALTHY_REASON: &str = "Unhealthy";

/// When to run the next pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requeue {
    Now,
    After(Duration),
}

impl Requeue {
    pub fn duration(&self) -> Duration {
        match self {
            Requeue::Now => Duration::ZERO,
            Requeue::After(d) => *d,
        }
    }
}

/// Default requeue for a phase.
pub fn requeue_for_phase(config: &OperatorConfig, phase: ClusterPhase) -> Requeue {
    match phase {
        ClusterPhase::Uninitialized => Requeue::Now,
        ClusterPhase::Creating => Requeue::After(config.creating_interval),
        ClusterPhase::Scaling => Requeue::After(config.scaling_interval),
        ClusterPhase::Running => Requeue::After(config.health_interval),
        ClusterPhase::Stopped => Requeue::After(config.stopped_interval),
        ClusterPhase::Failed => Requeue::After(config.failed_interval),
        ClusterPhase::Deleting => Requeue::After(config.creating_interval),
    }
}

/// Terminal error recorded on the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Failure {
    /// Condition reason, e.g. `EvenMemberCount`
    pub reason: String,
    pub message: String,
}

impl Failure {
    pub fn new(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Result of a phase handler execution.
#[derive(Debug)]
pub struct PhaseResult {
    /// The next phase to transition to.
    pub next_phase: ClusterPhase,
    /// Event driving the transition. `None` when staying in place.
    pub event: Option<ClusterEvent>,
    /// Optional message describing what happened.
    pub message: Option<String>,
    /// Terminal error, if the pass ended in one.
    pub failure: Option<Failure>,
    /// Requeue override. `None` uses the interval of `next_phase`.
    pub requeue: Option<Requeue>,
}

impl PhaseResult {
    /// Stay in (or report) a phase.
    pub fn new(next_phase: ClusterPhase) -> Self {
        Self {
            next_phase,
            event: None,
            message: None,
            failure: None,
            requeue: None,
        }
    }

    /// Create a phase result with a message.
    pub fn with_message(next_phase: ClusterPhase, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(next_phase)
        }
    }

    /// Move to `next_phase` on `event`.
    pub fn transition(event: ClusterEvent, next_phase: ClusterPhase) -> Self {
        Self {
            event: Some(event),
            ..Self::new(next_phase)
        }
    }

    /// Move to Failed with a terminal error.
    pub fn failed(event: ClusterEvent, failure: Failure) -> Self {
        Self {
            event: Some(event),
            message: Some(failure.message.clone()),
            failure: Some(failure),
            ..Self::new(ClusterPhase::Failed)
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn requeue(mut self, requeue: Requeue) -> Self {
        self.requeue = Some(requeue);
        self
    }
}

impl From<ClusterPhase> for PhaseResult {
    fn from(phase: ClusterPhase) -> Self {
        Self::new(phase)
    }
}

// ============================================================================
// Observation - what a pass has seen so far
// ============================================================================

/// State observed during one pass, filled in by the handlers.
#[derive(Debug, Default)]
pub struct Observation {
    /// StatefulSet replica count
    pub replicas: i32,
    /// Pods selected by the cluster's labels
    pub pods: Vec<Pod>,
    /// etcd member list, when etcd was consulted
    pub members: Option<Vec<MemberInfo>>,
}

impl Observation {
    /// Start from what the previous status recorded.
    pub fn from_status(cluster: &EtcdCluster) -> Self {
        Self {
            replicas: cluster
                .status
                .as_ref()
                .map(|s| s.current_replicas)
                .unwrap_or_default(),
            ..Default::default()
        }
    }

    pub fn ready_members(&self, cluster: &EtcdCluster) -> i32 {
        ready_member_count(cluster, &self.pods, self.replicas)
    }
}

/// Replica count a newly created StatefulSet starts with.
///
/// A single-member cluster starts its seed right away; larger clusters start
/// empty and grow one member per pass.
pub fn initial_replicas(desired: i32) -> i32 {
    if desired == 1 { 1 } else { 0 }
}

/// Ensure children and read pods.
async fn observe(ctx: &Context, cluster: &EtcdCluster, obs: &mut Observation) -> Result<()> {
    obs.replicas = ensure_all(ctx, cluster, initial_replicas(cluster.spec.members)).await?;
    obs.pods = ctx
        .platform
        .list_pods(&namespace_of(cluster), &pod_selector(cluster))
        .await?;
    Ok(())
}

/// Ensure children, turning a non-retryable platform error into a failure.
async fn observe_or_fail(
    ctx: &Context,
    cluster: &EtcdCluster,
    obs: &mut Observation,
) -> Result<Option<PhaseResult>> {
    match observe(ctx, cluster, obs).await {
        Ok(()) => Ok(None),
        Err(e) if e.is_retryable() => Err(e),
        Err(e) => {
            warn!(
                name = %cluster.name_any(),
                error = %e,
                "Child resources could not be reconciled"
            );
            Ok(Some(PhaseResult::failed(
                ClusterEvent::ReconcileError,
                Failure::new(RESOURCE_ERROR_REASON, e.to_string()),
            )))
        }
    }
}

/// Run one scaling step and fold its results into the observation.
async fn scale_step(
    ctx: &Context,
    cluster: &EtcdCluster,
    obs: &mut Observation,
) -> Result<StepReport> {
    let report = scaling::step(
        ctx,
        ScalingInput {
            cluster,
            current_replicas: obs.replicas,
            desired: cluster.spec.members,
            pods: &obs.pods,
        },
    )
    .await?;

    obs.replicas = report.replicas;
    if report.members.is_some() {
        obs.members = report.members.clone();
    }
    publish_step_event(ctx, cluster, &report.outcome).await;
    Ok(report)
}

async fn publish_step_event(ctx: &Context, cluster: &EtcdCluster, outcome: &StepOutcome) {
    match outcome {
        StepOutcome::MemberAdded { ordinal, id } => {
            ctx.publish_normal_event(
                cluster,
                "MemberAdded",
                "Scaling",
                Some(format!(
                    "Added {} to etcd as member {id:x}",
                    member_name(cluster, *ordinal)
                )),
            )
            .await;
        }
        StepOutcome::ScaledUp { replicas } => {
            ctx.publish_normal_event(
                cluster,
                "ScaledUp",
                "Scaling",
                Some(format!("Replicas increased to {replicas}")),
            )
            .await;
        }
        StepOutcome::ScaledDown { replicas } => {
            ctx.publish_normal_event(
                cluster,
                "MemberRemoved",
                "Scaling",
                Some(format!(
                    "Removed {} from etcd, replicas decreased to {replicas}",
                    member_name(cluster, *replicas)
                )),
            )
            .await;
        }
        StepOutcome::Converged | StepOutcome::Waiting(_) | StepOutcome::Stopped => {}
    }
}

/// Map a step outcome to the phase result shared by Creating, Scaling and Failed.
fn after_step(report: &StepReport, obs: &Observation, cluster: &EtcdCluster) -> PhaseResult {
    let desired = cluster.spec.members;
    match &report.outcome {
        StepOutcome::Stopped => {
            PhaseResult::transition(ClusterEvent::StopRequested, ClusterPhase::Stopped)
        }
        StepOutcome::Converged => {
            PhaseResult::transition(ClusterEvent::MembersConverged, ClusterPhase::Running).message(
                format!("{}/{desired} members ready", obs.ready_members(cluster)),
            )
        }
        StepOutcome::Waiting(reason) => {
            PhaseResult::transition(ClusterEvent::ScaleRequired, ClusterPhase::Scaling)
                .message(reason.clone())
        }
        StepOutcome::MemberAdded { ordinal, .. } => {
            PhaseResult::transition(ClusterEvent::ScaleRequired, ClusterPhase::Scaling).message(
                format!("Admitted {}, waiting for it to start", member_name(cluster, *ordinal)),
            )
        }
        StepOutcome::ScaledUp { replicas } | StepOutcome::ScaledDown { replicas } => {
            PhaseResult::transition(ClusterEvent::ScaleRequired, ClusterPhase::Scaling)
                .message(format!("Scaling to {desired} members, {replicas} replicas"))
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Uninitialized: the spec has already been validated by the caller.
pub async fn handle_uninitialized(_ctx: &Context, cluster: &EtcdCluster) -> Result<PhaseResult> {
    debug!(name = %cluster.name_any(), "Spec valid, creating cluster");
    Ok(
        PhaseResult::transition(ClusterEvent::SpecValidated, ClusterPhase::Creating)
            .message("Creating child resources")
            .requeue(Requeue::Now),
    )
}

/// Creating: ensure children and start the seed member.
pub async fn handle_creating(
    ctx: &Context,
    cluster: &EtcdCluster,
    obs: &mut Observation,
) -> Result<PhaseResult> {
    if let Some(failed) = observe_or_fail(ctx, cluster, obs).await? {
        return Ok(failed);
    }

    let report = scale_step(ctx, cluster, obs).await?;
    let desired = cluster.spec.members;

    let result = match &report.outcome {
        StepOutcome::Stopped => after_step(&report, obs, cluster),
        StepOutcome::Converged => after_step(&report, obs, cluster),
        _ if desired > 1 => after_step(&report, obs, cluster).requeue(Requeue::Now),
        // A single member is waiting for its pod to become ready.
        _ => PhaseResult::with_message(
            ClusterPhase::Creating,
            format!("Waiting for {} to become ready", member_name(cluster, 0)),
        ),
    };
    Ok(result)
}

/// Running: keep children in sync and check member health.
pub async fn handle_running(
    ctx: &Context,
    cluster: &EtcdCluster,
    obs: &mut Observation,
) -> Result<PhaseResult> {
    if let Some(failed) = observe_or_fail(ctx, cluster, obs).await? {
        return Ok(failed);
    }

    let desired = cluster.spec.members;
    let ready = obs.ready_members(cluster);
    if obs.replicas != desired || ready != desired {
        info!(
            name = %cluster.name_any(),
            replicas = obs.replicas,
            ready = ready,
            desired = desired,
            "Membership differs from spec"
        );
        return Ok(
            PhaseResult::transition(ClusterEvent::ScaleRequired, ClusterPhase::Scaling)
                .message(format!("{ready}/{desired} members ready, {} replicas", obs.replicas))
                .requeue(Requeue::Now),
        );
    }

    let healthy = check_health(ctx, cluster, obs).await;
    if is_quorum_healthy(healthy, desired) {
        Ok(PhaseResult::with_message(
            ClusterPhase::Running,
            format!("{healthy}/{desired} members healthy"),
        ))
    } else {
        warn!(name = %cluster.name_any(), healthy, desired, "Cluster lost quorum health");
        Ok(PhaseResult::failed(
            ClusterEvent::HealthCheckFailed,
            Failure::new(
                UNHEALTHY_REASON,
                format!("only {healthy}/{desired} members answered the health check"),
            ),
        ))
    }
}

/// Scaling: one step of the membership protocol.
pub async fn handle_scaling(
    ctx: &Context,
    cluster: &EtcdCluster,
    obs: &mut Observation,
) -> Result<PhaseResult> {
    if let Some(failed) = observe_or_fail(ctx, cluster, obs).await? {
        return Ok(failed);
    }

    let report = scale_step(ctx, cluster, obs).await?;
    let result = after_step(&report, obs, cluster);
    // Stay in place rather than re-entering Scaling from Scaling.
    if result.next_phase == ClusterPhase::Scaling {
        return Ok(PhaseResult {
            event: None,
            ..result
        });
    }
    Ok(result)
}

/// Stopped: wait for a non-zero member count.
pub async fn handle_stopped(
    ctx: &Context,
    cluster: &EtcdCluster,
    obs: &mut Observation,
) -> Result<PhaseResult> {
    observe(ctx, cluster, obs).await?;

    if cluster.spec.members > 0 {
        info!(
            name = %cluster.name_any(),
            members = cluster.spec.members,
            "Restarting stopped cluster"
        );
        return Ok(
            PhaseResult::transition(ClusterEvent::ScaleRequired, ClusterPhase::Scaling)
                .message("Restarting from the seed member")
                .requeue(Requeue::Now),
        );
    }

    if obs.replicas != 0 {
        scale_step(ctx, cluster, obs).await?;
    }
    Ok(PhaseResult::new(ClusterPhase::Stopped))
}

/// Failed: the spec is valid again, so redo the work of Creating.
pub async fn handle_failed(
    ctx: &Context,
    cluster: &EtcdCluster,
    obs: &mut Observation,
) -> Result<PhaseResult> {
    if let Some(failed) = observe_or_fail(ctx, cluster, obs).await? {
        return Ok(PhaseResult {
            event: None,
            ..failed
        });
    }

    let desired = cluster.spec.members;
    if desired == 0 {
        let report = scale_step(ctx, cluster, obs).await?;
        return Ok(after_step(&report, obs, cluster));
    }

    if obs.replicas != desired {
        return Ok(
            PhaseResult::transition(ClusterEvent::ScaleRequired, ClusterPhase::Scaling)
                .message(format!("Recovering, {} of {desired} replicas", obs.replicas))
                .requeue(Requeue::Now),
        );
    }

    let ready = obs.ready_members(cluster);
    if ready == desired {
        info!(name = %cluster.name_any(), "Cluster recovered");
        return Ok(
            PhaseResult::transition(ClusterEvent::MembersConverged, ClusterPhase::Running)
                .message(format!("{ready}/{desired} members ready")),
        );
    }

    Ok(PhaseResult::with_message(
        ClusterPhase::Failed,
        format!("{ready}/{desired} members ready"),
    ))
}

/// Whether more than half of `desired` members are healthy.
pub fn is_quorum_healthy(healthy: i32, desired: i32) -> bool {
    desired > 0 && healthy > desired / 2
}

/// Probe every member's client URL and count the ones that answer.
///
/// A cluster the operator cannot connect to has no healthy members. The
/// member list is read on the way for status; failing to read it does not
/// fail the check.
async fn check_health(ctx: &Context, cluster: &EtcdCluster, obs: &mut Observation) -> i32 {
    let client = match ctx.membership_client(cluster).await {
        Ok(client) => client,
        Err(e) => {
            warn!(name = %cluster.name_any(), error = %e, "Failed to connect to etcd");
            return 0;
        }
    };

    match client.list_members().await {
        Ok(members) => obs.members = Some(members),
        Err(e) => debug!(name = %cluster.name_any(), error = %e, "Failed to list members"),
    }

    let mut healthy = 0;
    for ordinal in 0..cluster.spec.members {
        if client.health_check(&client_url(cluster, ordinal)).await {
            healthy += 1;
        } else {
            debug!(member = %member_name(cluster, ordinal), "Member failed health check");
        }
    }
    healthy
}
