//! Admission policies for EtcdCluster.
//!
//! `member_count` applies to every request. `immutability` compares against
//! the stored object and only runs on UPDATE.

pub mod immutability;
pub mod member_count;

use crate::crd::EtcdCluster;

/// Outcome of one policy, or of the whole chain.
#[derive(Debug)]
pub struct ValidationResult {
    pub allowed: bool,
    /// Machine-readable denial reason (the same reasons the controller
    /// writes to the Ready condition)
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl ValidationResult {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            message: None,
        }
    }

    pub fn denied(reason: &str, message: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        }
    }
}

/// The request as seen by the policies.
pub struct ValidationContext<'a> {
    pub resource: &'a EtcdCluster,
    /// Stored object, present on UPDATE
    pub old_resource: Option<&'a EtcdCluster>,
    pub dry_run: bool,
    pub namespace: Option<&'a str>,
}

impl ValidationContext<'_> {
    pub fn is_update(&self) -> bool {
        self.old_resource.is_some()
    }
}

type Policy = fn(&ValidationContext<'_>) -> ValidationResult;

/// Run the policies in order and return the first denial.
pub fn validate_all(ctx: &ValidationContext<'_>) -> ValidationResult {
    let mut policies: Vec<Policy> = vec![member_count::validate];
    if ctx.is_update() {
        policies.push(immutability::validate);
    }

    policies
        .into_iter()
        .map(|policy| policy(ctx))
        .find(|result| !result.allowed)
        .unwrap_or_else(ValidationResult::allowed)
}
