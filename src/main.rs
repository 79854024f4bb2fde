//! etcd-operator entry point.
//!
//! Probes come up first so the pod is live while it waits for the lease.
//! Only the lease holder runs the controller; losing the lease exits the
//! process so Kubernetes restarts it into a fresh election.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use etcd_operator::health::{HealthState, run_health_server};
use etcd_operator::{OperatorConfig, run_controller};
use etcd_operator::{WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, run_webhook_server};

const LEASE_NAME: &str = "etcd-operator-leader";
const LEASE_TTL: Duration = Duration::from_secs(15);
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Time given to in-flight reconciles after SIGTERM.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// This replica's identity in the leader election.
struct Leadership {
    lock: LeaseLock,
    holder_id: String,
}

impl Leadership {
    fn new(client: Client) -> Self {
        let holder_id = std::env::var("POD_NAME").unwrap_or_else(|_| {
            warn!("POD_NAME not set, using hostname");
            hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string())
        });
        let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
            warn!("POD_NAMESPACE not set, using 'default'");
            "default".to_string()
        });
        info!(
            holder_id = %holder_id,
            namespace = %namespace,
            lease_name = LEASE_NAME,
            "Initializing leader election"
        );

        let lock = LeaseLock::new(
            client,
            &namespace,
            LeaseLockParams {
                holder_id: holder_id.clone(),
                lease_name: LEASE_NAME.to_string(),
                lease_ttl: LEASE_TTL,
            },
        );
        Self { lock, holder_id }
    }

    /// Block until this replica holds the lease.
    async fn acquire(&self) {
        info!("Waiting to acquire leadership");
        loop {
            match self.lock.try_acquire_or_renew().await {
                Ok(LeaseLockResult::Acquired(_)) => {
                    info!(holder_id = %self.holder_id, "Acquired leadership");
                    return;
                }
                Ok(_) => info!("Another instance is leader, waiting"),
                Err(e) => warn!(error = %e, "Failed to acquire lease, retrying"),
            }
            tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
        }
    }

    /// Renew forever; exit the process once the lease is lost.
    #[allow(clippy::exit)]
    fn hold(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
                match self.lock.try_acquire_or_renew().await {
                    Ok(LeaseLockResult::Acquired(_)) => {}
                    Ok(_) => {
                        error!("Lost leadership, shutting down");
                        std::process::exit(1);
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to renew lease, shutting down");
                        std::process::exit(1);
                    }
                }
            }
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("etcd_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .json()
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting etcd-operator");

    let config = OperatorConfig::from_env();
    info!(
        reconcile_timeout = ?config.reconcile_timeout,
        membership_timeout = ?config.membership_timeout,
        health_interval = ?config.health_interval,
        watch_namespace = ?config.watch_namespace,
        "Loaded operator configuration"
    );

    let client = Client::try_default().await?;
    let health_state = Arc::new(HealthState::new());

    let health_handle = tokio::spawn({
        let health_state = Arc::clone(&health_state);
        async move {
            if let Err(e) = run_health_server(health_state).await {
                error!(error = %e, "Health server error");
            }
        }
    });

    let leadership = Leadership::new(client.clone());
    leadership.acquire().await;
    let lease_handle = leadership.hold();

    let controller_handle = tokio::spawn({
        let health_state = Arc::clone(&health_state);
        async move { run_controller(client, config, Some(health_state)).await }
    });

    let webhook_handle = spawn_webhook_server();

    tokio::select! {
        result = controller_handle => {
            if let Err(e) = result {
                error!(error = %e, "Controller task panicked");
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!(error = %e, "Health server task panicked");
            }
        }
        result = async {
            match webhook_handle {
                Some(handle) => handle.await,
                None => std::future::pending().await,
            }
        } => {
            if let Err(e) = result {
                error!(error = %e, "Webhook server task panicked");
            }
        }
        // Only reachable if the renewal task panics
        Err(e) = lease_handle => {
            error!(error = %e, "Lease renewal task panicked");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            health_state.set_ready(false);
            info!(grace_period = ?SHUTDOWN_GRACE_PERIOD, "Waiting for in-flight reconciliations");
            tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;
        }
    }

    info!("Operator stopped");
    Ok(())
}

/// Start the admission webhook when its serving certificate is mounted.
fn spawn_webhook_server() -> Option<JoinHandle<()>> {
    if !(Path::new(WEBHOOK_CERT_PATH).exists() && Path::new(WEBHOOK_KEY_PATH).exists()) {
        info!("Webhook certificates not found, webhook server disabled");
        return None;
    }
    info!("TLS certificates found, starting webhook server");
    Some(tokio::spawn(async {
        if let Err(e) = run_webhook_server(WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH).await {
            error!(error = %e, "Webhook server error");
        }
    }))
}

/// Resolves on SIGTERM or SIGINT. Failing to install a handler is fatal.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
