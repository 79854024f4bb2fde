//! Membership client contract.
//!
//! `MembershipClient` is the only way the controller talks to etcd. Every
//! method applies its own timeout and returns a typed error; there is no
//! retry logic at this layer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// Errors that can occur during membership operations.
#[derive(Error, Debug)]
pub enum MembershipError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("Timeout after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    #[error("Member {0:x} not found")]
    MemberNotFound(u64),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl MembershipError {
    /// Whether the error means the member is already gone.
    pub fn is_member_not_found(&self) -> bool {
        match self {
            MembershipError::MemberNotFound(_) => true,
            MembershipError::Etcd(e) => e.to_string().contains("member not found"),
            _ => false,
        }
    }
}

/// One entry of the etcd membership list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemberInfo {
    /// Member ID assigned by etcd.
    pub id: u64,
    /// Member name. Empty until the member process has started.
    pub name: String,
    /// Advertised peer URLs.
    pub peer_urls: Vec<String>,
    /// Advertised client URLs. Empty until the member process has started.
    pub client_urls: Vec<String>,
}

impl MemberInfo {
    /// A member that was added but whose process never joined.
    pub fn is_unstarted(&self) -> bool {
        self.name.is_empty()
    }

    /// Whether this member advertises the given peer URL.
    pub fn has_peer_url(&self, peer_url: &str) -> bool {
        self.peer_urls.iter().any(|u| u == peer_url)
    }

    /// Member ID formatted the way etcdctl prints it.
    pub fn id_hex(&self) -> String {
        format!("{:x}", self.id)
    }
}

/// Administrative operations on an etcd cluster's membership.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MembershipClient: Send + Sync {
    /// List all members, including unstarted ones.
    async fn list_members(&self) -> Result<Vec<MemberInfo>, MembershipError>;

    /// Add a voting member advertising `peer_url`.
    async fn add_member(&self, peer_url: &str) -> Result<MemberInfo, MembershipError>;

    /// Remove a member by ID.
    async fn remove_member(&self, id: u64) -> Result<(), MembershipError>;

    /// Check whether the member serving `endpoint` answers a status request.
    async fn health_check(&self, endpoint: &str) -> bool;
}

/// Builds connected `MembershipClient`s.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MembershipConnector: Send + Sync {
    /// Connect to a cluster through the given client endpoints.
    async fn connect(
        &self,
        endpoints: &[String],
    ) -> Result<Arc<dyn MembershipClient>, MembershipError>;
}

/// Parse an etcd member ID written in hex (as stored in status).
pub fn parse_member_id(id: &str) -> Option<u64> {
    u64::from_str_radix(id, 16).ok()
}
