//! Validation logic for EtcdCluster specs and spec changes.
//!
//! This module provides:
//! - Member count validation (0, or odd in 1..=9)
//! - Version, name and quantity validation
//! - Spec change rules shared with the admission webhook

use std::sync::LazyLock;

use kube::ResourceExt;
use semver::Version;

use crate::controller::error::{Error, Result};
use crate::crd::{EtcdCluster, EtcdClusterSpec, MAX_MEMBERS};

/// Condition reasons reported for invalid specs.
pub mod reason {
    pub const INVALID_MEMBER_COUNT: &str = "InvalidMemberCount";
    pub const EVEN_MEMBER_COUNT: &str = "EvenMemberCount";
    pub const INVALID_VERSION: &str = "InvalidVersion";
    pub const INVALID_STORAGE_SIZE: &str = "InvalidStorageSize";
    pub const INVALID_NAME: &str = "InvalidName";
    pub const INVALID_RESOURCES: &str = "InvalidResources";
    pub const IMMUTABLE_FIELD: &str = "ImmutableField";
    pub const VERSION_DOWNGRADE: &str = "VersionDowngrade";
}

/// Minimum member count (0 means stopped)
pub const MIN_MEMBERS: i32 = 0;

/// Maximum name length. Leaves room for the `-client` suffix and for the
/// controller-revision-hash label StatefulSet pods carry.
pub const MAX_NAME_LENGTH: usize = 52;

/// Supported etcd major version.
pub const SUPPORTED_MAJOR: u64 = 3;

/// Validate the resource spec
pub fn validate_spec(resource: &EtcdCluster) -> Result<()> {
    validate_name(&resource.name_any())?;
    validate_members(resource.spec.members)?;
    validate_version(&resource.spec.version)?;
    validate_storage_size(&resource.spec.storage.size)?;
    validate_resource_quantities(&resource.spec)?;
    Ok(())
}

/// Validate the member count: 0 (stopped), or odd and at most 9.
pub fn validate_members(members: i32) -> Result<()> {
    if !(MIN_MEMBERS..=MAX_MEMBERS).contains(&members) {
        return Err(Error::validation(
            reason::INVALID_MEMBER_COUNT,
            format!(
                "member count {} is outside the allowed range {}..={}",
                members, MIN_MEMBERS, MAX_MEMBERS
            ),
        ));
    }
    if members > 1 && members % 2 == 0 {
        return Err(Error::validation(
            reason::EVEN_MEMBER_COUNT,
            format!(
                "member count {} is even; an even-sized cluster tolerates no more failures than the next smaller odd size",
                members
            ),
        ));
    }
    Ok(())
}

/// Validate the etcd version (semver, major version 3).
pub fn validate_version(version: &str) -> Result<()> {
    match Version::parse(version) {
        Ok(v) if v.major == SUPPORTED_MAJOR => Ok(()),
        Ok(v) => Err(Error::validation(
            reason::INVALID_VERSION,
            format!("etcd version {} is not supported, expected {}.x", v, SUPPORTED_MAJOR),
        )),
        Err(e) => Err(Error::validation(
            reason::INVALID_VERSION,
            format!("invalid version '{}': {}", version, e),
        )),
    }
}

/// Validate the resource name as a DNS-1035 label of bounded length.
pub fn validate_name(name: &str) -> Result<()> {
    static NAME_RE: LazyLock<Option<regex::Regex>> =
        LazyLock::new(|| regex::Regex::new(r"^[a-z]([-a-z0-9]*[a-z0-9])?$").ok());

    if name.len() > MAX_NAME_LENGTH {
        return Err(Error::validation(
            reason::INVALID_NAME,
            format!(
                "name '{}' exceeds maximum length of {} characters",
                name, MAX_NAME_LENGTH
            ),
        ));
    }
    if !NAME_RE.as_ref().is_some_and(|re| re.is_match(name)) {
        return Err(Error::validation(
            reason::INVALID_NAME,
            format!("name '{}' is not a valid DNS-1035 label", name),
        ));
    }
    Ok(())
}

/// Validate the storage size: a non-zero binary quantity.
pub fn validate_storage_size(size: &str) -> Result<()> {
    match parse_storage_bytes(size) {
        Some(bytes) if bytes > 0 => Ok(()),
        Some(_) => Err(Error::validation(
            reason::INVALID_STORAGE_SIZE,
            format!("storage size '{}' must be greater than zero", size),
        )),
        None => Err(Error::validation(
            reason::INVALID_STORAGE_SIZE,
            format!(
                "invalid storage size '{}'. Expected format: <number><unit> where unit is Ki, Mi, Gi, Ti, Pi, or Ei (e.g., 10Gi)",
                size
            ),
        )),
    }
}

/// Parse a storage quantity into bytes.
pub fn parse_storage_bytes(size: &str) -> Option<u128> {
    static STORAGE_RE: LazyLock<Option<regex::Regex>> =
        LazyLock::new(|| regex::Regex::new(r"^([0-9]+)(Ki|Mi|Gi|Ti|Pi|Ei)?$").ok());

    let caps = STORAGE_RE.as_ref()?.captures(size)?;
    let value: u128 = caps.get(1)?.as_str().parse().ok()?;
    let shift = match caps.get(2).map(|m| m.as_str()) {
        None => 0,
        Some("Ki") => 10,
        Some("Mi") => 20,
        Some("Gi") => 30,
        Some("Ti") => 40,
        Some("Pi") => 50,
        Some("Ei") => 60,
        Some(_) => return None,
    };
    value.checked_mul(1u128 << shift)
}

fn validate_resource_quantities(spec: &EtcdClusterSpec) -> Result<()> {
    let checks = [
        ("CPU request", &spec.resources.requests.cpu, is_valid_cpu as fn(&str) -> bool),
        ("memory request", &spec.resources.requests.memory, is_valid_memory),
        ("CPU limit", &spec.resources.limits.cpu, is_valid_cpu),
        ("memory limit", &spec.resources.limits.memory, is_valid_memory),
    ];
    for (what, value, valid) in checks {
        if !valid(value) {
            return Err(Error::validation(
                reason::INVALID_RESOURCES,
                format!("invalid {} '{}'", what, value),
            ));
        }
    }
    Ok(())
}

/// Check if a CPU string is valid
fn is_valid_cpu(cpu: &str) -> bool {
    // Pattern: ^([0-9]+m?|[0-9]*\.[0-9]+)$
    static CPU_RE: LazyLock<Option<regex::Regex>> =
        LazyLock::new(|| regex::Regex::new(r"^([0-9]+m?|[0-9]*\.[0-9]+)$").ok());
    CPU_RE.as_ref().is_some_and(|re| re.is_match(cpu))
}

/// Check if a memory string is valid
fn is_valid_memory(memory: &str) -> bool {
    // Pattern: ^([0-9]+)(Ki|Mi|Gi|Ti)?$
    static MEMORY_RE: LazyLock<Option<regex::Regex>> =
        LazyLock::new(|| regex::Regex::new(r"^([0-9]+)(Ki|Mi|Gi|Ti)?$").ok());
    MEMORY_RE.as_ref().is_some_and(|re| re.is_match(memory))
}

/// Check if the new version is a downgrade from the old version.
///
/// Returns false if either version cannot be parsed.
pub fn is_downgrade(old: &str, new: &str) -> bool {
    match (Version::parse(old), Version::parse(new)) {
        (Ok(old), Ok(new)) => new < old,
        _ => false,
    }
}

/// Validate a spec update against the previous spec.
///
/// Rejects changes the cluster cannot apply in place:
/// - storage class changes
/// - storage size reductions
/// - version downgrades
pub fn validate_spec_change(old: &EtcdClusterSpec, new: &EtcdClusterSpec) -> Result<()> {
    if old.storage.storage_class_name != new.storage.storage_class_name {
        return Err(Error::validation(
            reason::IMMUTABLE_FIELD,
            "spec.storage.storageClassName is immutable",
        ));
    }

    if let (Some(old_bytes), Some(new_bytes)) = (
        parse_storage_bytes(&old.storage.size),
        parse_storage_bytes(&new.storage.size),
    ) && new_bytes < old_bytes
    {
        return Err(Error::validation(
            reason::IMMUTABLE_FIELD,
            format!(
                "spec.storage.size cannot shrink from {} to {}",
                old.storage.size, new.storage.size
            ),
        ));
    }

    if is_downgrade(&old.version, &new.version) {
        return Err(Error::validation(
            reason::VERSION_DOWNGRADE,
            format!(
                "downgrade from {} to {} is not supported",
                old.version, new.version
            ),
        ));
    }

    Ok(())
}

/// Check if generation has changed (spec update)
pub fn generation_changed(resource: &EtcdCluster) -> bool {
    let generation = resource.metadata.generation;
    let observed = resource.status.as_ref().and_then(|s| s.observed_generation);

    match (generation, observed) {
        (Some(current_gen), Some(obs)) => current_gen != obs,
        (Some(_), None) => true,
        _ => false,
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::get_unwrap
)]
mod tests {
    use super::*;
    use crate::crd::EtcdClusterStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn create_test_resource(members: i32) -> EtcdCluster {
        EtcdCluster {
            metadata: ObjectMeta {
                name: Some("test-etcd".to_string()),
                namespace: Some("default".to_string()),
                generation: Some(1),
                ..Default::default()
            },
            spec: EtcdClusterSpec {
                members,
                ..Default::default()
            },
            status: None,
        }
    }

    fn reason_of(result: Result<()>) -> &'static str {
        match result {
            Err(Error::Validation { reason, .. }) => reason,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_members_valid() {
        for members in [0, 1, 3, 5, 7, 9] {
            assert!(validate_spec(&create_test_resource(members)).is_ok(), "{}", members);
        }
    }

    #[test]
    fn test_validate_members_even() {
        for members in [2, 4, 6, 8] {
            assert_eq!(
                reason_of(validate_members(members)),
                reason::EVEN_MEMBER_COUNT
            );
        }
    }

    #[test]
    fn test_validate_members_out_of_range() {
        assert_eq!(reason_of(validate_members(-1)), reason::INVALID_MEMBER_COUNT);
        assert_eq!(reason_of(validate_members(10)), reason::INVALID_MEMBER_COUNT);
        assert_eq!(reason_of(validate_members(11)), reason::INVALID_MEMBER_COUNT);
    }

    #[test]
    fn test_validate_version() {
        assert!(validate_version("3.5.17").is_ok());
        assert!(validate_version("3.6.0").is_ok());
        assert_eq!(reason_of(validate_version("2.3.8")), reason::INVALID_VERSION);
        assert_eq!(reason_of(validate_version("latest")), reason::INVALID_VERSION);
        assert_eq!(reason_of(validate_version("v3.5.17")), reason::INVALID_VERSION);
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("my-etcd").is_ok());
        assert_eq!(reason_of(validate_name("My-Etcd")), reason::INVALID_NAME);
        assert_eq!(reason_of(validate_name("1etcd")), reason::INVALID_NAME);
        assert_eq!(
            reason_of(validate_name(&"a".repeat(MAX_NAME_LENGTH + 1))),
            reason::INVALID_NAME
        );
    }

    #[test]
    fn test_validate_storage_size() {
        assert!(validate_storage_size("1Gi").is_ok());
        assert!(validate_storage_size("512Mi").is_ok());
        assert_eq!(reason_of(validate_storage_size("0Gi")), reason::INVALID_STORAGE_SIZE);
        assert_eq!(reason_of(validate_storage_size("1GB")), reason::INVALID_STORAGE_SIZE);
        assert_eq!(reason_of(validate_storage_size("")), reason::INVALID_STORAGE_SIZE);
    }

    #[test]
    fn test_parse_storage_bytes() {
        assert_eq!(parse_storage_bytes("1Ki"), Some(1024));
        assert_eq!(parse_storage_bytes("2Gi"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_storage_bytes("100"), Some(100));
        assert_eq!(parse_storage_bytes("1.5Gi"), None);
    }

    #[test]
    fn test_invalid_resources() {
        let mut resource = create_test_resource(3);
        resource.spec.resources.limits.memory = "lots".to_string();
        assert_eq!(reason_of(validate_spec(&resource)), reason::INVALID_RESOURCES);
    }

    #[test]
    fn test_spec_change_storage_class_immutable() {
        let old = EtcdClusterSpec::default();
        let mut new = old.clone();
        new.storage.storage_class_name = Some("fast".to_string());
        assert_eq!(reason_of(validate_spec_change(&old, &new)), reason::IMMUTABLE_FIELD);
    }

    #[test]
    fn test_spec_change_storage_shrink_rejected() {
        let mut old = EtcdClusterSpec::default();
        old.storage.size = "10Gi".to_string();
        let mut new = old.clone();
        new.storage.size = "5Gi".to_string();
        assert_eq!(reason_of(validate_spec_change(&old, &new)), reason::IMMUTABLE_FIELD);

        new.storage.size = "20Gi".to_string();
        assert!(validate_spec_change(&old, &new).is_ok());
    }

    #[test]
    fn test_spec_change_downgrade_rejected() {
        let old = EtcdClusterSpec::default();
        let mut new = old.clone();
        new.version = "3.4.30".to_string();
        assert_eq!(reason_of(validate_spec_change(&old, &new)), reason::VERSION_DOWNGRADE);

        new.version = "3.5.18".to_string();
        assert!(validate_spec_change(&old, &new).is_ok());
    }

    #[test]
    fn test_spec_change_members_allowed() {
        let old = EtcdClusterSpec::default();
        let new = EtcdClusterSpec {
            members: 5,
            ..old.clone()
        };
        assert!(validate_spec_change(&old, &new).is_ok());
    }

    #[test]
    fn test_generation_changed() {
        let mut resource = create_test_resource(3);
        assert!(generation_changed(&resource));

        resource.status = Some(EtcdClusterStatus {
            observed_generation: Some(1),
            ..Default::default()
        });
        assert!(!generation_changed(&resource));
    }
}
