//! Immutability validation policy.
//!
//! Tier 2 (Update): Only enforced on UPDATE operations
//!
//! Validates:
//! - Storage class cannot change and storage size cannot shrink
//! - Versions cannot be downgraded

use super::{ValidationContext, ValidationResult};
use crate::controller::cluster_validation::validate_spec_change;
use crate::controller::error::Error;

/// Validate immutability constraints on UPDATE operations
pub fn validate(ctx: &ValidationContext<'_>) -> ValidationResult {
    let old = match ctx.old_resource {
        Some(r) => r,
        None => return ValidationResult::allowed(), // Not an UPDATE
    };

    match validate_spec_change(&old.spec, &ctx.resource.spec) {
        Ok(()) => ValidationResult::allowed(),
        Err(Error::Validation { reason, message }) => ValidationResult::denied(reason, &message),
        Err(e) => ValidationResult::denied("ValidationFailed", &e.to_string()),
    }
}
