//! Reconciliation loop for EtcdCluster.
//!
//! This module contains the main reconcile function that handles the lifecycle
//! of EtcdCluster custom resources. A pass is level-triggered: it re-reads the
//! spec and status, runs the handler for the current phase, validates the
//! resulting phase change against the transition table, and writes status.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::{ResourceExt, runtime::controller::Action};
use tracing::{debug, error, info, instrument, warn};

use crate::controller::cluster_phases::{self, Failure, Observation, PhaseResult, requeue_for_phase};
use crate::controller::cluster_state_machine::{
    ClusterEvent, ClusterStateMachine, TransitionContext, TransitionResult,
};
use crate::controller::cluster_validation::{generation_changed, validate_spec};
use crate::controller::common::{cluster_key, has_finalizer};
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::status::{
    StatusInput, build_status, get_condition_reason, status_changed,
};
use crate::crd::{ClusterPhase, EtcdCluster, FINALIZER, ReclaimPolicy};
use crate::resources::common::{namespace_of, pod_selector};

/// Reconcile an EtcdCluster
///
/// This is the main reconciliation function called by the controller. The
/// whole pass is bounded by the configured reconcile timeout; on expiry no
/// status is written and the error policy requeues.
pub async fn reconcile(obj: Arc<EtcdCluster>, ctx: Arc<Context>) -> Result<Action> {
    let budget = ctx.config.reconcile_timeout;
    match tokio::time::timeout(budget, reconcile_cluster(&obj, &ctx)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(name = %obj.name_any(), timeout = ?budget, "Reconciliation timed out");
            Err(Error::Timeout(budget))
        }
    }
}

#[instrument(skip(obj, ctx), fields(name = %obj.name_any(), namespace = %namespace_of(obj)))]
async fn reconcile_cluster(obj: &EtcdCluster, ctx: &Context) -> Result<Action> {
    let start_time = Instant::now();
    let name = obj.name_any();
    let namespace = namespace_of(obj);

    if obj.metadata.deletion_timestamp.is_some() {
        return handle_deletion(obj, ctx).await;
    }

    if !has_finalizer(obj, FINALIZER) {
        info!("Adding finalizer");
        ctx.platform.add_finalizer(obj, FINALIZER).await?;
        return Ok(Action::requeue(Duration::ZERO));
    }

    let current_phase = obj.status.as_ref().map(|s| s.phase).unwrap_or_default();
    if current_phase == ClusterPhase::Deleting {
        return Ok(Action::await_change());
    }

    if generation_changed(obj) {
        info!(
            current_gen = ?obj.metadata.generation,
            observed_gen = ?obj.status.as_ref().and_then(|s| s.observed_generation),
            "Spec changed, reconciling"
        );
    }

    let mut obs = Observation::from_status(obj);
    let result = match validate_spec(obj) {
        Err(Error::Validation { reason, message }) => {
            warn!(reason = %reason, message = %message, "Spec validation failed");
            PhaseResult::failed(ClusterEvent::SpecInvalid, Failure::new(reason, message))
        }
        Err(e) => return Err(e),
        Ok(()) => run_phase(ctx, obj, current_phase, &mut obs).await?,
    };

    let state_machine = ClusterStateMachine::new();
    let transition_ctx =
        TransitionContext::new(obs.ready_members(obj), obj.spec.members, obs.replicas);
    let next_phase = resolve_phase(&state_machine, current_phase, &result, &transition_ctx);

    publish_phase_events(ctx, obj, current_phase, next_phase, &result).await;

    let status = build_status(
        obj,
        StatusInput {
            phase: next_phase,
            replicas: obs.replicas,
            pods: &obs.pods,
            admin_members: obs.members.as_deref(),
            message: result.message.as_deref(),
            failure: result
                .failure
                .as_ref()
                .filter(|_| next_phase == ClusterPhase::Failed)
                .map(|f| (f.reason.as_str(), f.message.as_str())),
        },
    );
    if obj
        .status
        .as_ref()
        .is_none_or(|old| status_changed(old, &status))
    {
        ctx.platform.patch_status(obj, &status).await?;
    } else {
        debug!("Status unchanged");
    }

    if let Some(health_state) = &ctx.health_state {
        let metrics = &health_state.metrics;
        metrics.record_reconcile(&namespace, &name, start_time.elapsed().as_secs_f64());
        metrics.set_cluster_members(
            &namespace,
            &name,
            i64::from(obj.spec.members),
            i64::from(status.ready_members),
        );
        if next_phase != current_phase {
            let from = obj.status.as_ref().map(|_| current_phase.as_str());
            metrics.record_phase_change(from, next_phase.as_str());
        }
        let now = u64::try_from(jiff::Timestamp::now().as_second()).unwrap_or_default();
        health_state
            .last_reconcile
            .store(now, std::sync::atomic::Ordering::Relaxed);
    }

    let requeue = match result.requeue {
        Some(requeue) if next_phase == result.next_phase => requeue,
        _ => requeue_for_phase(&ctx.config, next_phase),
    };
    debug!(phase = %next_phase, requeue = ?requeue, "Reconciliation complete");
    Ok(Action::requeue(requeue.duration()))
}

async fn run_phase(
    ctx: &Context,
    obj: &EtcdCluster,
    phase: ClusterPhase,
    obs: &mut Observation,
) -> Result<PhaseResult> {
    match phase {
        ClusterPhase::Uninitialized => cluster_phases::handle_uninitialized(ctx, obj).await,
        ClusterPhase::Creating => cluster_phases::handle_creating(ctx, obj, obs).await,
        ClusterPhase::Running => cluster_phases::handle_running(ctx, obj, obs).await,
        ClusterPhase::Scaling => cluster_phases::handle_scaling(ctx, obj, obs).await,
        ClusterPhase::Stopped => cluster_phases::handle_stopped(ctx, obj, obs).await,
        ClusterPhase::Failed => cluster_phases::handle_failed(ctx, obj, obs).await,
        ClusterPhase::Deleting => Ok(PhaseResult::new(ClusterPhase::Deleting)),
    }
}

/// Phase the cluster ends the pass in.
///
/// A change of phase must match an entry of the transition table and pass its
/// guard; otherwise the cluster stays where it was.
fn resolve_phase(
    state_machine: &ClusterStateMachine,
    current: ClusterPhase,
    result: &PhaseResult,
    ctx: &TransitionContext,
) -> ClusterPhase {
    if result.next_phase == current {
        return current;
    }
    let Some(event) = result.event else {
        warn!(from = %current, to = %result.next_phase, "Phase change without an event, ignoring");
        return current;
    };

    match state_machine.transition(&current, event, ctx) {
        TransitionResult::Success {
            from,
            to,
            event,
            description,
        } if to == result.next_phase => {
            info!(from = %from, to = %to, event = %event, "{}", description);
            to
        }
        TransitionResult::Success { to, .. } => {
            warn!(
                from = %current,
                expected = %result.next_phase,
                table = %to,
                event = %event,
                "Transition target mismatch, keeping phase"
            );
            current
        }
        TransitionResult::InvalidTransition { current, event } => {
            warn!(phase = %current, event = %event, "Invalid transition, keeping phase");
            current
        }
        TransitionResult::GuardFailed { from, reason, .. } => {
            debug!(phase = %from, event = %event, reason = %reason, "Transition guard failed");
            from
        }
    }
}

async fn publish_phase_events(
    ctx: &Context,
    obj: &EtcdCluster,
    current: ClusterPhase,
    next: ClusterPhase,
    result: &PhaseResult,
) {
    if next != current
        && let Some(event) = result.event
    {
        ctx.publish_normal_event(
            obj,
            &event.to_string(),
            "Reconcile",
            Some(format!("{current} -> {next}")),
        )
        .await;
    }

    if next == ClusterPhase::Failed
        && let Some(failure) = &result.failure
    {
        let previous_reason = obj
            .status
            .as_ref()
            .and_then(|s| get_condition_reason(&s.conditions, "Ready"));
        if next != current || previous_reason != Some(failure.reason.as_str()) {
            ctx.publish_warning_event(
                obj,
                &failure.reason,
                "Reconcile",
                Some(failure.message.clone()),
            )
            .await;
        }
    }
}

/// Error policy for the controller
pub fn error_policy(obj: Arc<EtcdCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = namespace_of(&obj);

    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_error(&namespace, &name);
    }

    if error.is_not_found() {
        debug!(name = %name, "Resource not found (likely deleted)");
        return Action::await_change();
    }

    if error.is_retryable() {
        warn!(name = %name, error = %error, "Retryable error, will retry");
    } else {
        error!(name = %name, error = %error, "Non-retryable error");
    }
    Action::requeue(error.requeue_after())
}

/// Handle deletion of an EtcdCluster
///
/// Any failure returns an error so the finalizer stays and the deletion is
/// retried.
async fn handle_deletion(obj: &EtcdCluster, ctx: &Context) -> Result<Action> {
    if !has_finalizer(obj, FINALIZER) {
        return Ok(Action::await_change());
    }
    info!("Handling deletion");

    let current = obj.status.as_ref().map(|s| s.phase).unwrap_or_default();
    if current != ClusterPhase::Deleting {
        let replicas = obj
            .status
            .as_ref()
            .map(|s| s.current_replicas)
            .unwrap_or_default();
        let status = build_status(
            obj,
            StatusInput {
                phase: ClusterPhase::Deleting,
                replicas,
                pods: &[],
                admin_members: None,
                message: Some("Cluster is being deleted"),
                failure: None,
            },
        );
        if let Err(e) = ctx.platform.patch_status(obj, &status).await {
            warn!(error = %e, "Failed to record Deleting phase");
        }
        ctx.publish_normal_event(
            obj,
            &ClusterEvent::DeletionRequested.to_string(),
            "Delete",
            Some(format!("{current} -> {}", ClusterPhase::Deleting)),
        )
        .await;
    }

    if ctx.membership.release(&cluster_key(obj)).await {
        debug!("Released membership client");
    }

    if obj.spec.storage.reclaim_policy == ReclaimPolicy::Delete {
        let deleted = ctx
            .platform
            .delete_pvcs(&namespace_of(obj), &pod_selector(obj))
            .await?;
        info!(count = deleted, "Deleted member volumes");
    }

    ctx.platform.remove_finalizer(obj, FINALIZER).await?;
    info!("Finalizer removed");
    Ok(Action::await_change())
}
