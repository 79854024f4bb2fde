//! Probe and metrics endpoints.
//!
//! - `/healthz`: liveness, 200 while the process serves requests
//! - `/readyz`: 200 once this replica leads and runs the controller
//! - `/metrics`: Prometheus text exposition

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tracing::{error, info};

pub const HEALTH_PORT: u16 = 8080;

/// Identifies one EtcdCluster.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ClusterLabels {
    pub namespace: String,
    pub name: String,
}

impl ClusterLabels {
    fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl EncodeLabelSet for ClusterLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct MembershipLabels {
    pub cluster: ClusterLabels,
    /// "add" or "remove"
    pub operation: String,
}

impl EncodeLabelSet for MembershipLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        self.cluster.encode(encoder)?;
        ("operation", self.operation.as_str()).encode(encoder.encode_label())
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PhaseLabels {
    pub phase: String,
}

impl EncodeLabelSet for PhaseLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("phase", self.phase.as_str()).encode(encoder.encode_label())
    }
}

/// Operator metrics, all prefixed `etcdoperator_`.
pub struct Metrics {
    pub reconciliations_total: Family<ClusterLabels, Counter>,
    pub reconciliation_errors_total: Family<ClusterLabels, Counter>,
    pub reconcile_duration_seconds: Family<ClusterLabels, Histogram>,
    /// Clusters per phase, as seen by this replica
    pub clusters_total: Family<PhaseLabels, Gauge>,
    pub cluster_members_desired: Family<ClusterLabels, Gauge>,
    pub cluster_members_ready: Family<ClusterLabels, Gauge>,
    pub membership_changes_total: Family<MembershipLabels, Counter>,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("etcdoperator");

        let reconciliations_total = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "reconciliations",
            "Total number of reconciliations",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "reconciliation_errors",
            "Total number of failed reconciliations",
            reconciliation_errors_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ClusterLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.005, 2.0, 12))
            });
        registry.register(
            "reconcile_duration_seconds",
            "Duration of one reconciliation pass in seconds",
            reconcile_duration_seconds.clone(),
        );

        let clusters_total = Family::<PhaseLabels, Gauge>::default();
        registry.register(
            "clusters_total",
            "Number of EtcdCluster resources by phase",
            clusters_total.clone(),
        );

        let cluster_members_desired = Family::<ClusterLabels, Gauge>::default();
        registry.register(
            "cluster_members_desired",
            "Desired voting members per cluster",
            cluster_members_desired.clone(),
        );

        let cluster_members_ready = Family::<ClusterLabels, Gauge>::default();
        registry.register(
            "cluster_members_ready",
            "Ready members per cluster",
            cluster_members_ready.clone(),
        );

        let membership_changes_total = Family::<MembershipLabels, Counter>::default();
        registry.register(
            "membership_changes",
            "Member add and remove calls issued against etcd",
            membership_changes_total.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            clusters_total,
            cluster_members_desired,
            cluster_members_ready,
            membership_changes_total,
            registry,
        }
    }

    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = ClusterLabels::new(namespace, name);
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    pub fn record_error(&self, namespace: &str, name: &str) {
        self.reconciliation_errors_total
            .get_or_create(&ClusterLabels::new(namespace, name))
            .inc();
    }

    /// Move one cluster from `from` to `to` in the per-phase gauge.
    pub fn record_phase_change(&self, from: Option<&str>, to: &str) {
        let gauge = |phase: &str| {
            self.clusters_total.get_or_create(&PhaseLabels {
                phase: phase.to_string(),
            })
        };
        if let Some(from) = from {
            gauge(from).dec();
        }
        gauge(to).inc();
    }

    pub fn set_cluster_members(&self, namespace: &str, name: &str, desired: i64, ready: i64) {
        let labels = ClusterLabels::new(namespace, name);
        self.cluster_members_desired
            .get_or_create(&labels)
            .set(desired);
        self.cluster_members_ready.get_or_create(&labels).set(ready);
    }

    pub fn record_membership_change(&self, namespace: &str, name: &str, operation: &str) {
        self.membership_changes_total
            .get_or_create(&MembershipLabels {
                cluster: ClusterLabels::new(namespace, name),
                operation: operation.to_string(),
            })
            .inc();
    }

    /// Render the registry in Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            error!(error = %e, "Failed to encode metrics");
            return "# Error encoding metrics\n".to_string();
        }
        buffer
    }
}

/// State shared between the controller and the probe server.
pub struct HealthState {
    ready: AtomicBool,
    pub metrics: Metrics,
    /// Unix seconds of the last successful reconcile
    pub last_reconcile: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Starts not ready; the controller flips it once it runs.
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            metrics: Metrics::new(),
            last_reconcile: AtomicU64::new(0),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready() {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.encode(),
    )
}

pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve probes and metrics on `0.0.0.0:HEALTH_PORT`.
pub async fn run_health_server(state: Arc<HealthState>) -> Result<(), std::io::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], HEALTH_PORT));
    info!(port = HEALTH_PORT, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, create_router(state)).await
}
