//! Validating admission webhook for EtcdCluster.
//!
//! Serves `POST /validate-etcdcluster` over TLS on port 9443. The serving
//! certificate is expected at `/etc/webhook/certs/` (e.g. issued by
//! cert-manager); without it main.rs does not start this server and the
//! controller still rejects invalid specs through the Ready condition.

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::post};
use axum_server::tls_rustls::RustlsConfig;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::crd::EtcdCluster;
use crate::webhooks::policies::{ValidationContext, validate_all};

pub const WEBHOOK_CERT_PATH: &str = "/etc/webhook/certs/tls.crt";
pub const WEBHOOK_KEY_PATH: &str = "/etc/webhook/certs/tls.key";
pub const WEBHOOK_PORT: u16 = 9443;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
    #[error("Webhook server error: {0}")]
    Server(String),
}

pub fn create_webhook_router() -> Router {
    Router::new().route("/validate-etcdcluster", post(validate_etcdcluster))
}

async fn validate_etcdcluster(
    Json(review): Json<AdmissionReview<EtcdCluster>>,
) -> impl IntoResponse {
    let request: AdmissionRequest<EtcdCluster> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to extract admission request");
            return (
                StatusCode::BAD_REQUEST,
                Json(
                    AdmissionResponse::invalid(format!("Invalid AdmissionReview: {}", e))
                        .into_review(),
                ),
            );
        }
    };

    (StatusCode::OK, Json(admit(&request).into_review()))
}

/// Decide one admission request.
///
/// kube's `deny` only carries a message, so denials read `[Reason] message`.
pub fn admit(request: &AdmissionRequest<EtcdCluster>) -> AdmissionResponse {
    let uid = &request.uid;
    debug!(
        uid = %uid,
        operation = ?request.operation,
        namespace = ?request.namespace,
        name = %request.name,
        "Processing admission request"
    );

    if request.operation == Operation::Delete {
        return AdmissionResponse::from(request);
    }

    let Some(resource) = request.object.as_ref() else {
        warn!(uid = %uid, "Admission request without object");
        return AdmissionResponse::from(request).deny("[InvalidRequest] Missing object in request");
    };

    let result = validate_all(&ValidationContext {
        resource,
        old_resource: request.old_object.as_ref(),
        dry_run: request.dry_run,
        namespace: request.namespace.as_deref(),
    });

    if result.allowed {
        info!(uid = %uid, name = %request.name, "Admission request allowed");
        return AdmissionResponse::from(request);
    }

    let reason = result.reason.as_deref().unwrap_or("ValidationFailed");
    let message = result.message.as_deref().unwrap_or("Validation failed");
    warn!(uid = %uid, reason, message, "Admission request denied");
    AdmissionResponse::from(request).deny(format!("[{}] {}", reason, message))
}

/// Serve the webhook with the PEM certificate and key at the given paths.
pub async fn run_webhook_server(cert_path: &str, key_path: &str) -> Result<(), WebhookError> {
    let tls = RustlsConfig::from_pem_file(PathBuf::from(cert_path), PathBuf::from(key_path))
        .await
        .map_err(|e| WebhookError::TlsConfig(e.to_string()))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], WEBHOOK_PORT));
    info!(port = WEBHOOK_PORT, "Webhook server listening with TLS");

    axum_server::bind_rustls(addr, tls)
        .serve(create_webhook_router().into_make_service())
        .await
        .map_err(|e| WebhookError::Server(e.to_string()))
}
