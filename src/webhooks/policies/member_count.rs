//! Member count validation policy.
//!
//! Tier 1 (Critical): Always enforced
//!
//! Validates:
//! - Member count is 0 (stopped) or odd and at most 9
//! - Version, name and storage quantities parse

use super::{ValidationContext, ValidationResult};
use crate::controller::cluster_validation::validate_spec;
use crate::controller::error::Error;

/// Validate the spec of the incoming resource
pub fn validate(ctx: &ValidationContext<'_>) -> ValidationResult {
    match validate_spec(ctx.resource) {
        Ok(()) => ValidationResult::allowed(),
        Err(Error::Validation { reason, message }) => ValidationResult::denied(reason, &message),
        Err(e) => ValidationResult::denied("ValidationFailed", &e.to_string()),
    }
}
