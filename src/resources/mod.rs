//! Resource generation module.
//!
//! Contains builders for the Kubernetes resources owned by an EtcdCluster.
//! Builders are pure: the same cluster and replica count always produce the
//! same object.
//!
//! ## Resources Generated
//!
//! | Resource | Purpose |
//! |----------|---------|
//! | StatefulSet | Stable member identity and per-member storage |
//! | Peer Service | Headless, per-member DNS (publishNotReadyAddresses) |
//! | Client Service | Client access endpoint |
//! | ConfigMap | Member bootstrap script |
//! | PodDisruptionBudget | Maintain quorum during disruptions |

pub mod common;
pub mod configmap;
pub mod pdb;
pub mod services;
pub mod statefulset;

pub use common::{owner_reference, standard_labels};
