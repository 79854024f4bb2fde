//! etcd membership client module.
//!
//! This module wraps the etcd Cluster and Maintenance APIs behind a narrow
//! trait so the scaling protocol can be driven against a real cluster or an
//! in-memory fake.
//!
//! ## Architecture
//!
//! - `membership`: `MembershipClient` / `MembershipConnector` traits and types
//! - `etcd`: implementation over the `etcd-client` crate
//! - `pool`: per-cluster cache of connected clients
//!
//! Clients never retry. A failed call surfaces as a `MembershipError` and the
//! reconciler decides whether to requeue.

pub mod etcd;
pub mod membership;
pub mod pool;

pub use etcd::{EtcdConnector, EtcdMembershipClient};
pub use membership::{MemberInfo, MembershipClient, MembershipConnector, MembershipError};
pub use pool::MembershipClients;
