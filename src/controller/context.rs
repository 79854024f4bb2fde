//! Shared context for the controller.
//!
//! The Context struct holds shared state that is passed to the reconciler:
//! the platform API, the membership client cache and operator configuration.

use std::sync::Arc;

use kube::ResourceExt;
use kube::runtime::events::EventType;

use crate::client::{MembershipClient, MembershipClients, MembershipError};
use crate::config::OperatorConfig;
use crate::controller::common::cluster_key;
use crate::controller::platform::PlatformApi;
use crate::crd::EtcdCluster;
use crate::health::HealthState;
use crate::resources::common::client_service_endpoint;

pub use crate::controller::platform::FIELD_MANAGER;

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Kubernetes API
    pub platform: Arc<dyn PlatformApi>,
    /// Connected etcd membership clients, one per cluster
    pub membership: Arc<MembershipClients>,
    /// Timeouts and requeue intervals
    pub config: OperatorConfig,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    /// Create a new context
    pub fn new(
        platform: Arc<dyn PlatformApi>,
        membership: Arc<MembershipClients>,
        config: OperatorConfig,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            platform,
            membership,
            config,
            health_state,
        }
    }

    /// Membership client for a cluster, connected through its client Service.
    pub async fn membership_client(
        &self,
        cluster: &EtcdCluster,
    ) -> Result<Arc<dyn MembershipClient>, MembershipError> {
        let endpoints = vec![client_service_endpoint(cluster)];
        self.membership.get(&cluster_key(cluster), &endpoints).await
    }

    /// Count a member add or remove in the metrics.
    pub fn record_membership_change(&self, cluster: &EtcdCluster, operation: &str) {
        if let Some(health_state) = &self.health_state {
            health_state.metrics.record_membership_change(
                &cluster.namespace().unwrap_or_default(),
                &cluster.name_any(),
                operation,
            );
        }
    }

    /// Publish a normal event for a cluster
    pub async fn publish_normal_event(
        &self,
        cluster: &EtcdCluster,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.platform
            .publish_event(cluster, EventType::Normal, reason, action, note)
            .await;
    }

    /// Publish a warning event for a cluster
    pub async fn publish_warning_event(
        &self,
        cluster: &EtcdCluster,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.platform
            .publish_event(cluster, EventType::Warning, reason, action, note)
            .await;
    }
}
