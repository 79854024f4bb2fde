//! Controller module for etcd-operator.
//!
//! Contains the reconciliation loop, state machine, error handling, status management,
//! membership scaling, and validation logic.

// Shared modules
pub mod common;
pub mod context;
pub mod error;
pub mod platform;
pub mod status;

// EtcdCluster controller
pub mod cluster_phases;
pub mod cluster_reconciler;
pub mod cluster_state_machine;
pub mod cluster_validation;
pub mod resource_reconciler;
pub mod scaling;
