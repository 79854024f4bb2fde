//! Formal finite state machine for EtcdCluster lifecycle management.
//!
//! Every phase change the reconciler makes is looked up in a declarative
//! transition table. A change with no table entry, or whose guard fails, is
//! refused and the cluster keeps its current phase.
//!
//! ## Lifecycle
//!
//! Uninitialized → Creating → Scaling → ... → Running
//!
//! Running ⇄ Scaling while members are added or removed one at a time.
//! Scaling → Stopped when the desired member count is 0.
//! Any phase except Deleting → Failed on invalid spec or failed health check.
//! Any phase → Deleting once a deletion timestamp is set. Deleting is terminal.

use std::fmt;

use crate::crd::ClusterPhase;

/// Events that trigger state transitions in the cluster lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterEvent {
    /// The spec passed validation
    SpecValidated,
    /// The spec failed validation
    SpecInvalid,
    /// Replica count and desired member count differ
    ScaleRequired,
    /// Every desired member is admitted and ready
    MembersConverged,
    /// Desired member count is zero and the workload is scaled down
    StopRequested,
    /// Fewer than a quorum of members answered the health check
    HealthCheckFailed,
    /// Child resources could not be reconciled
    ReconcileError,
    /// Deletion timestamp has been set on the resource
    DeletionRequested,
}

impl ClusterEvent {
    /// All events, in declaration order.
    pub const ALL: [ClusterEvent; 8] = [
        ClusterEvent::SpecValidated,
        ClusterEvent::SpecInvalid,
        ClusterEvent::ScaleRequired,
        ClusterEvent::MembersConverged,
        ClusterEvent::StopRequested,
        ClusterEvent::HealthCheckFailed,
        ClusterEvent::ReconcileError,
        ClusterEvent::DeletionRequested,
    ];
}

impl fmt::Display for ClusterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterEvent::SpecValidated => write!(f, "SpecValidated"),
            ClusterEvent::SpecInvalid => write!(f, "SpecInvalid"),
            ClusterEvent::ScaleRequired => write!(f, "ScaleRequired"),
            ClusterEvent::MembersConverged => write!(f, "MembersConverged"),
            ClusterEvent::StopRequested => write!(f, "StopRequested"),
            ClusterEvent::HealthCheckFailed => write!(f, "HealthCheckFailed"),
            ClusterEvent::ReconcileError => write!(f, "ReconcileError"),
            ClusterEvent::DeletionRequested => write!(f, "DeletionRequested"),
        }
    }
}

/// Observed counts available to transition guards
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext {
    /// Members whose pod is ready
    pub ready_members: i32,
    /// Desired member count from spec
    pub desired_members: i32,
    /// StatefulSet replica count
    pub current_replicas: i32,
}

impl TransitionContext {
    /// Create a new transition context
    pub fn new(ready_members: i32, desired_members: i32, current_replicas: i32) -> Self {
        Self {
            ready_members,
            desired_members,
            current_replicas,
        }
    }

    /// Check if the desired members all exist and are ready
    pub fn all_members_ready(&self) -> bool {
        self.desired_members > 0
            && self.current_replicas == self.desired_members
            && self.ready_members >= self.desired_members
    }

    /// Check if the workload has been scaled to nothing
    pub fn is_stopped(&self) -> bool {
        self.desired_members == 0 && self.current_replicas == 0
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    /// Source state
    pub from: ClusterPhase,
    /// Target state
    pub to: ClusterPhase,
    /// Event that triggers this transition
    pub event: ClusterEvent,
    /// Human-readable description of this transition
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: ClusterPhase,
        to: ClusterPhase,
        event: ClusterEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was successful
    Success {
        from: ClusterPhase,
        to: ClusterPhase,
        event: ClusterEvent,
        description: &'static str,
    },
    /// Transition was not valid for current state
    InvalidTransition {
        current: ClusterPhase,
        event: ClusterEvent,
    },
    /// Guard condition prevented the transition
    GuardFailed {
        from: ClusterPhase,
        to: ClusterPhase,
        event: ClusterEvent,
        reason: String,
    },
}

/// Formal state machine for EtcdCluster lifecycle
pub struct ClusterStateMachine {
    transitions: Vec<Transition>,
}

impl Default for ClusterStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterStateMachine {
    /// Create a new state machine with the defined transition table
    pub fn new() -> Self {
        use ClusterEvent as E;
        use ClusterPhase as P;

        Self {
            transitions: vec![
                // ========================================
                // Uninitialized
                // ========================================
                Transition::new(
                    P::Uninitialized,
                    P::Creating,
                    E::SpecValidated,
                    "Spec accepted, creating resources",
                ),
                Transition::new(
                    P::Uninitialized,
                    P::Failed,
                    E::SpecInvalid,
                    "Spec rejected",
                ),
                // ========================================
                // Creating
                // ========================================
                Transition::new(
                    P::Creating,
                    P::Scaling,
                    E::ScaleRequired,
                    "Seed member started, adding remaining members",
                ),
                Transition::new(
                    P::Creating,
                    P::Running,
                    E::MembersConverged,
                    "Single member ready",
                ),
                Transition::new(
                    P::Creating,
                    P::Stopped,
                    E::StopRequested,
                    "Created with zero members",
                ),
                Transition::new(
                    P::Creating,
                    P::Failed,
                    E::ReconcileError,
                    "Child resources could not be created",
                ),
                Transition::new(P::Creating, P::Failed, E::SpecInvalid, "Spec rejected"),
                // ========================================
                // Running
                // ========================================
                Transition::new(
                    P::Running,
                    P::Scaling,
                    E::ScaleRequired,
                    "Member count or readiness changed",
                ),
                Transition::new(
                    P::Running,
                    P::Failed,
                    E::HealthCheckFailed,
                    "Quorum of members unhealthy",
                ),
                Transition::new(
                    P::Running,
                    P::Failed,
                    E::ReconcileError,
                    "Child resources could not be updated",
                ),
                Transition::new(P::Running, P::Failed, E::SpecInvalid, "Spec rejected"),
                // ========================================
                // Scaling
                // ========================================
                Transition::new(
                    P::Scaling,
                    P::Running,
                    E::MembersConverged,
                    "All desired members admitted and ready",
                ),
                Transition::new(
                    P::Scaling,
                    P::Stopped,
                    E::StopRequested,
                    "Scaled to zero members",
                ),
                Transition::new(
                    P::Scaling,
                    P::Failed,
                    E::ReconcileError,
                    "Child resources could not be updated",
                ),
                Transition::new(P::Scaling, P::Failed, E::SpecInvalid, "Spec rejected"),
                // ========================================
                // Stopped
                // ========================================
                Transition::new(
                    P::Stopped,
                    P::Scaling,
                    E::ScaleRequired,
                    "Restarting from the seed member",
                ),
                Transition::new(P::Stopped, P::Failed, E::SpecInvalid, "Spec rejected"),
                // ========================================
                // Failed
                // ========================================
                Transition::new(
                    P::Failed,
                    P::Running,
                    E::MembersConverged,
                    "Recovered, all members ready",
                ),
                Transition::new(
                    P::Failed,
                    P::Scaling,
                    E::ScaleRequired,
                    "Recovering, member count differs",
                ),
                Transition::new(
                    P::Failed,
                    P::Stopped,
                    E::StopRequested,
                    "Recovered with zero members",
                ),
                // ========================================
                // Deletion (from every phase but Deleting)
                // ========================================
                Transition::new(
                    P::Uninitialized,
                    P::Deleting,
                    E::DeletionRequested,
                    "Deletion requested",
                ),
                Transition::new(
                    P::Creating,
                    P::Deleting,
                    E::DeletionRequested,
                    "Deletion requested",
                ),
                Transition::new(
                    P::Running,
                    P::Deleting,
                    E::DeletionRequested,
                    "Deletion requested",
                ),
                Transition::new(
                    P::Scaling,
                    P::Deleting,
                    E::DeletionRequested,
                    "Deletion requested",
                ),
                Transition::new(
                    P::Stopped,
                    P::Deleting,
                    E::DeletionRequested,
                    "Deletion requested",
                ),
                Transition::new(
                    P::Failed,
                    P::Deleting,
                    E::DeletionRequested,
                    "Deletion requested",
                ),
            ],
        }
    }

    /// Attempt a transition from `current` on `event`.
    pub fn transition(
        &self,
        current: &ClusterPhase,
        event: ClusterEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event);

        match transition {
            Some(t) => match self.check_guard(t, ctx) {
                Some(reason) => TransitionResult::GuardFailed {
                    from: t.from,
                    to: t.to,
                    event,
                    reason,
                },
                None => TransitionResult::Success {
                    from: t.from,
                    to: t.to,
                    event,
                    description: t.description,
                },
            },
            None => TransitionResult::InvalidTransition {
                current: *current,
                event,
            },
        }
    }

    /// Check if an event has a transition out of `from`
    pub fn can_transition(&self, from: &ClusterPhase, event: &ClusterEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.event == *event)
    }

    /// Events with a transition out of `state`
    pub fn valid_events(&self, state: &ClusterPhase) -> Vec<&ClusterEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == *state)
            .map(|t| &t.event)
            .collect()
    }

    /// Target phase of the transition for (`from`, `event`), ignoring guards
    pub fn target(&self, from: &ClusterPhase, event: &ClusterEvent) -> Option<ClusterPhase> {
        self.transitions
            .iter()
            .find(|t| t.from == *from && t.event == *event)
            .map(|t| t.to)
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match transition.event {
            ClusterEvent::MembersConverged if !ctx.all_members_ready() => Some(format!(
                "Not all members ready: {}/{} ready, {} replicas",
                ctx.ready_members, ctx.desired_members, ctx.current_replicas
            )),
            ClusterEvent::StopRequested if !ctx.is_stopped() => Some(format!(
                "Cannot stop: desired {}, replicas {}",
                ctx.desired_members, ctx.current_replicas
            )),
            _ => None,
        }
    }
}
