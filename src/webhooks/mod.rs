//! Validating admission webhook for EtcdCluster.
//!
//! Rejects at admission time the same specs the controller would park in
//! Failed, plus updates that cannot be applied in place (downgrades, storage
//! class changes, volume shrinks).

pub mod policies;
mod server;

pub use policies::{ValidationContext, ValidationResult};
pub use server::{
    WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT, WebhookError, admit, create_webhook_router,
    run_webhook_server,
};

// Re-exported for contract tests
pub use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
