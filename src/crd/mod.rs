//! Custom Resource Definitions (CRDs) for etcd-operator.
//!
//! - `EtcdCluster`: Deploy and manage an etcd cluster and its membership

mod etcd_cluster;

pub use etcd_cluster::*;
