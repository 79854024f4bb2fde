//! Multi-pass scenarios driven against the in-memory fakes.
//!
//! Each test builds a `World`, reconciles it pass by pass and asserts on the
//! resulting phase, status and recorded side effects.

use etcd_operator::controller::platform::ChildKind;
use etcd_operator::crd::{ClusterPhase, FINALIZER, ReclaimPolicy};
use etcd_operator::resources::common::{client_url, member_name, peer_url};

use crate::common::{EtcdClusterBuilder, three_member_cluster};
use crate::fake::{Call, World};

/// Bring a fresh cluster of `members` to Running.
async fn running_world(members: i32) -> World {
    let cluster = EtcdClusterBuilder::new("main")
        .namespace("db")
        .members(members)
        .generation(1)
        .uid("main-uid")
        .build();
    let mut world = World::new(cluster);
    world.run_until(ClusterPhase::Running, 30).await;
    world
}

fn ready_condition_reason(world: &World) -> Option<String> {
    world
        .status()
        .conditions
        .iter()
        .find(|c| c.r#type == "Ready")
        .map(|c| c.reason.clone())
}

// ============================================================================
// Creation
// ============================================================================

#[tokio::test]
async fn test_first_pass_only_adds_finalizer() {
    let mut world = World::new(three_member_cluster("main"));

    world.reconcile().await.unwrap();

    assert_eq!(world.calls(), vec![Call::AddFinalizer]);
    assert_eq!(
        world.cluster.metadata.finalizers,
        Some(vec![FINALIZER.to_string()])
    );
    assert_eq!(world.phase(), ClusterPhase::Uninitialized);
}

#[tokio::test]
async fn test_create_three_members_reaches_running() {
    let mut world = World::new(three_member_cluster("main"));
    let mut phases = vec![world.phase()];

    for _ in 0..30 {
        world.reconcile().await.unwrap();
        world.advance();
        if phases.last() != Some(&world.phase()) {
            phases.push(world.phase());
        }
        if world.phase() == ClusterPhase::Running {
            break;
        }
    }

    assert_eq!(
        phases,
        vec![
            ClusterPhase::Uninitialized,
            ClusterPhase::Creating,
            ClusterPhase::Scaling,
            ClusterPhase::Running,
        ]
    );

    let status = world.status();
    assert_eq!(status.ready_members, 3);
    assert_eq!(status.current_replicas, 3);
    assert_eq!(status.members.len(), 3);
    assert!(status.members.iter().all(|m| m.ready && m.id.is_some()));
    assert_eq!(status.current_version.as_deref(), Some("3.5.17"));
    assert_eq!(world.etcd.members().len(), 3);
    assert_eq!(world.platform.replicas(), 3);
}

#[tokio::test]
async fn test_create_builds_every_child() {
    let world = running_world(3).await;

    assert_eq!(world.platform.child_count(), ChildKind::ALL.len());
    for kind in ChildKind::ALL {
        assert!(
            world.calls().contains(&Call::CreateChild(kind)),
            "{kind} was never created"
        );
    }
}

#[tokio::test]
async fn test_create_adds_members_in_ordinal_order() {
    let world = running_world(5).await;

    let added: Vec<Call> = world
        .calls()
        .into_iter()
        .filter(Call::is_membership_change)
        .collect();
    let expected: Vec<Call> = (1..5)
        .map(|o| Call::AddMember(peer_url(&world.cluster, o)))
        .collect();
    assert_eq!(added, expected);
}

#[tokio::test]
async fn test_single_member_cluster_starts_with_seed() {
    let cluster = EtcdClusterBuilder::new("solo")
        .namespace("db")
        .members(1)
        .generation(1)
        .build();
    let mut world = World::new(cluster);

    world.run_until(ClusterPhase::Running, 10).await;

    assert_eq!(world.status().ready_members, 1);
    assert!(!world.calls().iter().any(Call::is_membership_change));
    assert!(!world.calls().iter().any(|c| matches!(c, Call::PatchReplicas(_))));
}

#[tokio::test]
async fn test_replicas_change_by_at_most_one_per_pass() {
    let mut world = World::new(three_member_cluster("main"));
    let mut previous = world.platform.replicas();

    for _ in 0..30 {
        world.reconcile().await.unwrap();
        world.advance();
        let replicas = world.platform.replicas();
        assert!((replicas - previous).abs() <= 1, "{previous} -> {replicas}");
        previous = replicas;
        if world.phase() == ClusterPhase::Running {
            break;
        }
    }
    assert_eq!(world.phase(), ClusterPhase::Running);
}

// ============================================================================
// Steady state
// ============================================================================

#[tokio::test]
async fn test_running_cluster_is_idempotent() {
    let mut world = running_world(3).await;
    // One pass to settle the health message.
    world.run(1).await;

    let writes = world.write_count();
    world.run(3).await;

    assert_eq!(world.calls_since(writes), vec![]);
    assert_eq!(world.phase(), ClusterPhase::Running);
}

#[tokio::test]
async fn test_unhealthy_quorum_fails_cluster() {
    let mut world = running_world(3).await;
    world.etcd.set_unhealthy(client_url(&world.cluster, 1));
    world.etcd.set_unhealthy(client_url(&world.cluster, 2));

    world.reconcile().await.unwrap();

    assert_eq!(world.phase(), ClusterPhase::Failed);
    assert_eq!(ready_condition_reason(&world).as_deref(), Some("Unhealthy"));
    assert!(
        world
            .platform
            .events()
            .iter()
            .any(|e| e.warning && e.reason == "Unhealthy")
    );
}

#[tokio::test]
async fn test_single_unhealthy_member_keeps_quorum() {
    let mut world = running_world(3).await;
    world.etcd.set_unhealthy(client_url(&world.cluster, 2));

    world.reconcile().await.unwrap();

    assert_eq!(world.phase(), ClusterPhase::Running);
}

#[tokio::test]
async fn test_rejected_child_fails_cluster() {
    let mut world = running_world(3).await;
    world
        .platform
        .rejected_kinds
        .lock()
        .unwrap()
        .insert(ChildKind::StatefulSet);
    // A version change forces the StatefulSet to be rewritten.
    world.cluster.spec.version = "3.5.18".to_string();

    world.reconcile().await.unwrap();

    assert_eq!(world.phase(), ClusterPhase::Failed);
    assert_eq!(
        ready_condition_reason(&world).as_deref(),
        Some("ResourceError")
    );
}

// ============================================================================
// Scaling
// ============================================================================

#[tokio::test]
async fn test_scale_down_removes_before_decrement() {
    let mut world = running_world(3).await;
    let id_of = |world: &World, ordinal: i32| {
        let peer = peer_url(&world.cluster, ordinal);
        world
            .etcd
            .members()
            .iter()
            .find(|m| m.has_peer_url(&peer))
            .map(|m| m.id)
            .unwrap()
    };
    let id2 = id_of(&world, 2);
    let id1 = id_of(&world, 1);
    let writes = world.write_count();

    world.set_members(1);
    world.run_until(ClusterPhase::Running, 10).await;

    let ordered: Vec<Call> = world
        .calls_since(writes)
        .into_iter()
        .filter(|c| matches!(c, Call::RemoveMember(_) | Call::PatchReplicas(_)))
        .collect();
    assert_eq!(
        ordered,
        vec![
            Call::RemoveMember(id2),
            Call::PatchReplicas(2),
            Call::RemoveMember(id1),
            Call::PatchReplicas(1),
        ]
    );
    assert_eq!(world.etcd.members().len(), 1);
    assert_eq!(world.status().ready_members, 1);
    assert_eq!(world.status().members.len(), 1);
}

#[tokio::test]
async fn test_scale_up_from_one_to_three() {
    let mut world = running_world(1).await;

    world.set_members(3);
    world.run_until(ClusterPhase::Running, 20).await;

    assert_eq!(world.platform.replicas(), 3);
    assert_eq!(world.etcd.members().len(), 3);
    assert_eq!(world.status().ready_members, 3);
}

#[tokio::test]
async fn test_scale_to_zero_stops_without_removals() {
    let mut world = running_world(3).await;
    let writes = world.write_count();

    world.set_members(0);
    world.run_until(ClusterPhase::Stopped, 5).await;

    let since = world.calls_since(writes);
    assert!(!since.iter().any(|c| matches!(c, Call::RemoveMember(_))));
    let patches: Vec<&Call> = since
        .iter()
        .filter(|c| matches!(c, Call::PatchReplicas(_)))
        .collect();
    assert_eq!(patches, vec![&Call::PatchReplicas(0)]);
    assert_eq!(world.platform.replicas(), 0);
    assert_eq!(world.status().ready_members, 0);
    // Data is kept, so the member list survives.
    assert_eq!(world.etcd.members().len(), 3);
}

#[tokio::test]
async fn test_stopped_cluster_restarts() {
    let mut world = running_world(3).await;
    world.set_members(0);
    world.run_until(ClusterPhase::Stopped, 5).await;

    world.set_members(3);
    world.run_until(ClusterPhase::Running, 20).await;

    assert_eq!(world.status().ready_members, 3);
    // Members kept their identity through the stop.
    assert_eq!(world.etcd.members().len(), 3);
}

#[tokio::test]
async fn test_direction_change_mid_scale() {
    let mut world = running_world(1).await;
    world.set_members(5);
    // Grow part of the way.
    for _ in 0..4 {
        world.reconcile().await.unwrap();
        world.advance();
    }
    assert!(world.platform.replicas() > 1);

    world.set_members(1);
    world.run_until(ClusterPhase::Running, 20).await;

    assert_eq!(world.platform.replicas(), 1);
    let seed = member_name(&world.cluster, 0);
    let names: Vec<String> = world.etcd.members().into_iter().map(|m| m.name).collect();
    assert_eq!(names, vec![seed]);
}

#[tokio::test]
async fn test_unstarted_member_is_replaced() {
    let mut world = running_world(1).await;
    // An earlier add for ordinal 1 was interrupted before the member started.
    let stale = world.etcd.seed(&world.cluster, 1, false);

    world.set_members(3);
    world.run_until(ClusterPhase::Running, 20).await;

    assert!(world.calls().contains(&Call::RemoveMember(stale)));
    assert!(!world.etcd.members().iter().any(|m| m.id == stale));
    assert_eq!(world.etcd.members().len(), 3);
}

#[tokio::test]
async fn test_unreachable_etcd_requeues_without_failing() {
    let mut world = running_world(1).await;
    world.set_members(3);
    world.reconcile().await.unwrap();
    world.advance();
    world.etcd.set_unreachable(true);

    let mut errors = 0;
    for _ in 0..3 {
        if world.reconcile().await.is_err() {
            errors += 1;
        }
        world.advance();
    }

    assert!(errors > 0);
    assert_ne!(world.phase(), ClusterPhase::Failed);

    world.etcd.set_unreachable(false);
    world.run_until(ClusterPhase::Running, 20).await;
}

#[tokio::test]
async fn test_connect_failure_after_restart_fails_cluster() {
    let mut world = running_world(3).await;
    world.etcd.set_unreachable(true);
    world.restart_operator().await;

    world.reconcile().await.unwrap();

    assert_eq!(world.phase(), ClusterPhase::Failed);
    assert_eq!(ready_condition_reason(&world).as_deref(), Some("Unhealthy"));
}

#[tokio::test]
async fn test_status_conflict_retries_without_repeating_membership_change() {
    let mut world = running_world(1).await;
    world.set_members(3);
    for _ in 0..5 {
        if world.platform.replicas() == 2 {
            break;
        }
        world.reconcile().await.unwrap();
        world.advance();
    }
    assert_eq!(world.platform.replicas(), 2);
    let phase = world.phase();
    let add = Call::AddMember(peer_url(&world.cluster, 1));

    // The pass that admits main-1 loses its status write
    let writes = world.write_count();
    world.platform.fail_next_status_patch(409, "Conflict");
    let err = world.reconcile().await.unwrap_err();
    assert!(err.is_retryable());
    let since = world.calls_since(writes);
    assert!(since.contains(&add));
    assert!(!since.iter().any(|c| matches!(c, Call::PatchStatus(_))));
    assert_eq!(world.phase(), phase);
    world.advance();

    let writes = world.write_count();
    world.reconcile().await.unwrap();
    let since = world.calls_since(writes);
    assert!(since.contains(&Call::PatchStatus(phase)));
    assert!(!since.iter().any(Call::is_membership_change));

    world.run_until(ClusterPhase::Running, 20).await;
    assert_eq!(world.calls().iter().filter(|c| **c == add).count(), 1);
}

// ============================================================================
// Validation
// ============================================================================

#[tokio::test]
async fn test_even_member_count_fails() {
    let cluster = EtcdClusterBuilder::new("main")
        .namespace("db")
        .members(4)
        .generation(1)
        .build();
    let mut world = World::new(cluster);

    world.run(2).await;

    assert_eq!(world.phase(), ClusterPhase::Failed);
    assert_eq!(
        ready_condition_reason(&world).as_deref(),
        Some("EvenMemberCount")
    );
    assert!(
        world
            .platform
            .events()
            .iter()
            .any(|e| e.warning && e.reason == "EvenMemberCount")
    );
    // Nothing was created for an invalid spec.
    assert_eq!(world.platform.child_count(), 0);
}

#[tokio::test]
async fn test_invalid_spec_on_running_cluster_keeps_workload() {
    let mut world = running_world(3).await;
    let writes = world.write_count();

    world.set_members(4);
    world.run(2).await;

    assert_eq!(world.phase(), ClusterPhase::Failed);
    assert_eq!(world.platform.replicas(), 3);
    assert!(
        !world
            .calls_since(writes)
            .iter()
            .any(|c| matches!(c, Call::PatchReplicas(_) | Call::RemoveMember(_)))
    );
}

#[tokio::test]
async fn test_failed_cluster_recovers_when_spec_fixed() {
    let mut world = running_world(3).await;
    world.set_members(4);
    world.run(1).await;
    assert_eq!(world.phase(), ClusterPhase::Failed);

    world.set_members(3);
    world.run_until(ClusterPhase::Running, 5).await;

    assert_eq!(ready_condition_reason(&world).as_deref(), Some("AllMembersReady"));
}

// ============================================================================
// Deletion
// ============================================================================

#[tokio::test]
async fn test_deletion_retains_volumes_by_default() {
    let mut world = running_world(3).await;
    world.cluster.metadata.deletion_timestamp = Some(
        k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(jiff::Timestamp::now()),
    );
    let writes = world.write_count();

    world.reconcile().await.unwrap();

    let since = world.calls_since(writes);
    assert_eq!(
        since,
        vec![Call::PatchStatus(ClusterPhase::Deleting), Call::RemoveFinalizer]
    );
    assert!(world.platform.finalizers().is_empty());
}

#[tokio::test]
async fn test_deletion_with_delete_policy_removes_volumes() {
    let cluster = EtcdClusterBuilder::new("main")
        .namespace("db")
        .members(1)
        .generation(1)
        .reclaim_policy(ReclaimPolicy::Delete)
        .build();
    let mut world = World::new(cluster);
    world.run_until(ClusterPhase::Running, 10).await;
    world.cluster.metadata.deletion_timestamp = Some(
        k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(jiff::Timestamp::now()),
    );
    let writes = world.write_count();

    world.reconcile().await.unwrap();

    let since = world.calls_since(writes);
    let pvc = since.iter().position(|c| *c == Call::DeletePvcs).unwrap();
    let finalizer = since
        .iter()
        .position(|c| *c == Call::RemoveFinalizer)
        .unwrap();
    assert!(pvc < finalizer);
}

#[tokio::test]
async fn test_deletion_without_finalizer_is_noop() {
    let cluster = EtcdClusterBuilder::new("main")
        .namespace("db")
        .members(3)
        .deleting()
        .build();
    let mut world = World::new(cluster);

    world.reconcile().await.unwrap();

    assert!(world.calls().is_empty());
}
