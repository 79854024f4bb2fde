// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for etcd-operator.
//!
//! These tests run without a Kubernetes cluster and test individual
//! components in isolation.

#[path = "../common/mod.rs"]
mod common;

mod crd_tests {
    use etcd_operator::crd::{ClusterPhase, Condition, EtcdClusterStatus};

    #[test]
    fn test_phase_display() {
        assert_eq!(ClusterPhase::Uninitialized.to_string(), "Uninitialized");
        assert_eq!(ClusterPhase::Creating.to_string(), "Creating");
        assert_eq!(ClusterPhase::Running.to_string(), "Running");
        assert_eq!(ClusterPhase::Scaling.to_string(), "Scaling");
        assert_eq!(ClusterPhase::Stopped.to_string(), "Stopped");
        assert_eq!(ClusterPhase::Failed.to_string(), "Failed");
        assert_eq!(ClusterPhase::Deleting.to_string(), "Deleting");
    }

    #[test]
    fn test_phase_default() {
        assert_eq!(ClusterPhase::default(), ClusterPhase::Uninitialized);
    }

    #[test]
    fn test_unknown_phase_reads_as_uninitialized() {
        let status: EtcdClusterStatus =
            serde_json::from_value(serde_json::json!({ "phase": "Exploded" })).unwrap();
        assert_eq!(status.phase, ClusterPhase::Uninitialized);
    }

    #[test]
    fn test_condition_ready() {
        let condition = Condition::ready(true, "AllMembersReady", "3/3 members ready", Some(1));
        assert_eq!(condition.r#type, "Ready");
        assert_eq!(condition.status, "True");
        assert_eq!(condition.reason, "AllMembersReady");
        assert_eq!(condition.observed_generation, Some(1));
    }

    #[test]
    fn test_condition_degraded() {
        let condition = Condition::degraded(true, "Stopped", "Scaled to zero", Some(3));
        assert_eq!(condition.r#type, "Degraded");
        assert_eq!(condition.status, "True");
    }
}

mod state_machine_tests {
    use etcd_operator::controller::cluster_state_machine::{
        ClusterEvent, ClusterStateMachine, TransitionContext, TransitionResult,
    };
    use etcd_operator::crd::ClusterPhase;

    #[test]
    fn test_valid_events_from_uninitialized() {
        let sm = ClusterStateMachine::new();
        assert!(sm.can_transition(&ClusterPhase::Uninitialized, &ClusterEvent::SpecValidated));
        assert!(sm.can_transition(&ClusterPhase::Uninitialized, &ClusterEvent::SpecInvalid));
        assert!(!sm.can_transition(&ClusterPhase::Uninitialized, &ClusterEvent::MembersConverged));
    }

    #[test]
    fn test_running_scales_and_fails() {
        let sm = ClusterStateMachine::new();
        assert_eq!(
            sm.target(&ClusterPhase::Running, &ClusterEvent::ScaleRequired),
            Some(ClusterPhase::Scaling)
        );
        assert_eq!(
            sm.target(&ClusterPhase::Running, &ClusterEvent::HealthCheckFailed),
            Some(ClusterPhase::Failed)
        );
        assert_eq!(
            sm.target(&ClusterPhase::Running, &ClusterEvent::ReconcileError),
            Some(ClusterPhase::Failed)
        );
    }

    #[test]
    fn test_stop_guard_requires_zero_replicas() {
        let sm = ClusterStateMachine::new();
        let not_yet = TransitionContext::new(0, 0, 1);
        assert!(matches!(
            sm.transition(&ClusterPhase::Scaling, ClusterEvent::StopRequested, &not_yet),
            TransitionResult::GuardFailed { .. }
        ));

        let stopped = TransitionContext::new(0, 0, 0);
        assert!(matches!(
            sm.transition(&ClusterPhase::Scaling, ClusterEvent::StopRequested, &stopped),
            TransitionResult::Success {
                to: ClusterPhase::Stopped,
                ..
            }
        ));
    }

    #[test]
    fn test_deleting_is_terminal() {
        let sm = ClusterStateMachine::new();
        assert!(
            sm.valid_events(&ClusterPhase::Deleting).is_empty(),
            "Deleting should have no valid events"
        );
    }

    #[test]
    fn test_deletion_from_all_states() {
        let sm = ClusterStateMachine::new();
        for state in ClusterPhase::ALL
            .into_iter()
            .filter(|p| *p != ClusterPhase::Deleting)
        {
            assert!(
                sm.can_transition(&state, &ClusterEvent::DeletionRequested),
                "Should be able to delete from {:?}",
                state
            );
        }
    }
}

mod validation_tests {
    use etcd_operator::controller::cluster_validation::{
        reason, validate_spec, validate_spec_change,
    };
    use etcd_operator::controller::error::Error;

    use crate::common::EtcdClusterBuilder;

    fn reason_of(result: Result<(), Error>) -> Option<&'static str> {
        match result {
            Err(Error::Validation { reason, .. }) => Some(reason),
            _ => None,
        }
    }

    #[test]
    fn test_default_spec_is_valid() {
        let cluster = EtcdClusterBuilder::new("main").namespace("db").build();
        assert!(validate_spec(&cluster).is_ok());
    }

    #[test]
    fn test_even_member_count() {
        let cluster = EtcdClusterBuilder::new("main").members(6).build();
        assert_eq!(reason_of(validate_spec(&cluster)), Some(reason::EVEN_MEMBER_COUNT));
    }

    #[test]
    fn test_unsupported_version() {
        let cluster = EtcdClusterBuilder::new("main").version("2.3.8").build();
        assert_eq!(reason_of(validate_spec(&cluster)), Some(reason::INVALID_VERSION));
    }

    #[test]
    fn test_bad_storage_size() {
        let cluster = EtcdClusterBuilder::new("main").storage_size("lots").build();
        assert_eq!(reason_of(validate_spec(&cluster)), Some(reason::INVALID_STORAGE_SIZE));
    }

    #[test]
    fn test_invalid_name() {
        let cluster = EtcdClusterBuilder::new("Main_Cluster").build();
        assert_eq!(reason_of(validate_spec(&cluster)), Some(reason::INVALID_NAME));
    }

    #[test]
    fn test_version_downgrade_rejected() {
        let old = EtcdClusterBuilder::new("main").version("3.5.17").build();
        let new = EtcdClusterBuilder::new("main").version("3.5.9").build();
        assert_eq!(
            reason_of(validate_spec_change(&old.spec, &new.spec)),
            Some(reason::VERSION_DOWNGRADE)
        );
        assert!(validate_spec_change(&new.spec, &old.spec).is_ok());
    }
}

mod error_tests {
    use std::time::Duration;

    use etcd_operator::client::MembershipError;
    use etcd_operator::controller::error::Error;

    fn api_error(code: u16, reason: &str) -> Error {
        Error::Kube(kube::Error::Api(
            kube::core::Status::failure("test", reason)
                .with_code(code)
                .boxed(),
        ))
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(api_error(504, "Timeout").is_retryable());
        assert!(api_error(409, "Conflict").is_retryable());
        assert!(!api_error(422, "Invalid").is_retryable());
        assert!(Error::Membership(MembershipError::Connection("refused".into())).is_retryable());
        assert!(!Error::validation("EvenMemberCount", "even").is_retryable());
    }

    #[test]
    fn test_conflict_and_already_exists_are_distinct() {
        let exists = api_error(409, "AlreadyExists");
        assert!(exists.is_already_exists());
        assert!(!exists.is_conflict());

        let conflict = api_error(409, "Conflict");
        assert!(conflict.is_conflict());
        assert!(!conflict.is_already_exists());
    }

    #[test]
    fn test_requeue_after() {
        assert_eq!(
            Error::Transient("blip".into()).requeue_after(),
            Duration::from_secs(30)
        );
        assert_eq!(
            Error::Permanent("nope".into()).requeue_after(),
            Duration::from_secs(300)
        );
    }
}

mod status_tests {
    use etcd_operator::controller::status::{ConditionBuilder, is_condition_true};
    use etcd_operator::crd::Condition;

    #[test]
    fn test_condition_builder() {
        let mut builder = ConditionBuilder::new();
        builder
            .ready(true, "AllMembersReady", "3/3 members ready", Some(1))
            .progressing(false, "Converged", "", Some(1))
            .degraded(false, "Healthy", "", Some(1));
        let conditions = builder.build();

        assert_eq!(conditions.len(), 3);
        assert!(is_condition_true(&conditions, "Ready"));
        assert!(!is_condition_true(&conditions, "Progressing"));
    }

    #[test]
    fn test_builder_keeps_transition_time_for_same_status() {
        let mut original = vec![Condition::ready(true, "AllMembersReady", "old", Some(1))];
        original[0].last_transition_time = "2024-01-01T00:00:00Z".to_string();

        let mut builder = ConditionBuilder::from_existing(&original);
        builder.ready(true, "AllMembersReady", "new", Some(2));
        let conditions = builder.build();

        assert_eq!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
        assert_eq!(conditions[0].message, "new");
    }
}

mod resource_tests {
    use etcd_operator::resources::common::{
        client_service_endpoint, member_name, ordinal_from_name, peer_url,
    };
    use etcd_operator::resources::configmap::{config_hash, generate_configmap};
    use etcd_operator::resources::pdb::max_unavailable;
    use etcd_operator::resources::services::generate_peer_service;
    use etcd_operator::resources::statefulset::{generate_statefulset, image_for};

    use crate::common::EtcdClusterBuilder;

    #[test]
    fn test_member_addressing() {
        let cluster = EtcdClusterBuilder::new("main").namespace("db").build();
        assert_eq!(member_name(&cluster, 2), "main-2");
        assert_eq!(
            peer_url(&cluster, 2),
            "http://main-2.main-peer.db.svc:2380"
        );
        assert_eq!(
            client_service_endpoint(&cluster),
            "http://main-client.db.svc:2379"
        );
        assert_eq!(ordinal_from_name("main", "main-7"), Some(7));
        assert_eq!(ordinal_from_name("main", "other-7"), None);
    }

    #[test]
    fn test_peer_service_publishes_not_ready_addresses() {
        let cluster = EtcdClusterBuilder::new("main").namespace("db").build();
        let spec = generate_peer_service(&cluster).spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
    }

    #[test]
    fn test_statefulset_uses_replicas_and_image() {
        let cluster = EtcdClusterBuilder::new("main")
            .namespace("db")
            .version("3.5.17")
            .build();
        let sts = generate_statefulset(&cluster, 2, "abc");
        assert_eq!(sts.spec.as_ref().unwrap().replicas, Some(2));
        assert_eq!(image_for(&cluster), "quay.io/coreos/etcd:v3.5.17");
    }

    #[test]
    fn test_config_hash_tracks_config() {
        let a = EtcdClusterBuilder::new("main").namespace("db").build();
        let b = EtcdClusterBuilder::new("main").namespace("other").build();
        assert_eq!(
            config_hash(&generate_configmap(&a)),
            config_hash(&generate_configmap(&a))
        );
        assert_ne!(
            config_hash(&generate_configmap(&a)),
            config_hash(&generate_configmap(&b))
        );
    }

    #[test]
    fn test_pdb_keeps_quorum() {
        assert_eq!(max_unavailable(1), 1);
        assert_eq!(max_unavailable(3), 1);
        assert_eq!(max_unavailable(5), 2);
        assert_eq!(max_unavailable(7), 3);
    }
}

mod config_tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use etcd_operator::config::OperatorConfig;

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("ETCD_OPERATOR_RECONCILE_TIMEOUT_SECS", "90"),
            ("ETCD_OPERATOR_MEMBERSHIP_TIMEOUT_SECS", "60"),
            ("ETCD_OPERATOR_WATCH_NAMESPACE", "db"),
        ]);
        let config = OperatorConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.reconcile_timeout, Duration::from_secs(90));
        // Membership calls are capped.
        assert_eq!(config.membership_timeout, Duration::from_secs(10));
        assert_eq!(config.watch_namespace.as_deref(), Some("db"));
    }
}

mod webhook_contract_tests {
    use etcd_operator::crd::{EtcdCluster, EtcdClusterSpec};
    use etcd_operator::webhooks::{AdmissionReview, AdmissionRequest, ValidationContext};
    use etcd_operator::webhooks::policies::validate_all;

    fn review(members: i32) -> serde_json::Value {
        let object = EtcdCluster::new(
            "main",
            EtcdClusterSpec {
                members,
                ..Default::default()
            },
        );
        serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "etcdoperator.smoketurner.com", "version": "v1alpha1", "kind": "EtcdCluster"},
                "resource": {"group": "etcdoperator.smoketurner.com", "version": "v1alpha1", "resource": "etcdclusters"},
                "name": "main",
                "namespace": "db",
                "operation": "CREATE",
                "userInfo": {"username": "admin"},
                "object": object,
                "dryRun": false
            }
        })
    }

    fn allowed(members: i32) -> bool {
        let review: AdmissionReview<EtcdCluster> = serde_json::from_value(review(members)).unwrap();
        let request: AdmissionRequest<EtcdCluster> = review.try_into().unwrap();
        let object = request.object.clone().unwrap();
        let ctx = ValidationContext {
            resource: &object,
            old_resource: request.old_object.as_ref(),
            dry_run: request.dry_run,
            namespace: request.namespace.as_deref(),
        };
        validate_all(&ctx).allowed
    }

    #[test]
    fn test_review_deserializes_and_validates() {
        assert!(allowed(3));
        assert!(allowed(0));
        assert!(!allowed(4));
    }
}
