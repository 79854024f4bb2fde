//! Child resource reconciliation.
//!
//! `ensure` builds the desired object for one owned kind, compares the
//! salient fields with what exists, and creates or replaces only when they
//! differ. Running it twice against unchanged inputs writes nothing.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::platform::{ChildKind, ChildObject};
use crate::crd::EtcdCluster;
use crate::resources::common::{
    client_service_name, configmap_name, namespace_of, peer_service_name,
};
use crate::resources::configmap::{config_hash, generate_configmap};
use crate::resources::pdb::generate_pod_disruption_budget;
use crate::resources::services::{generate_client_service, generate_peer_service};
use crate::resources::statefulset::{etcd_container, generate_statefulset, template_config_hash};

/// What `ensure` did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Name of the child object of `kind`.
pub fn child_name(cluster: &EtcdCluster, kind: ChildKind) -> String {
    match kind {
        ChildKind::StatefulSet | ChildKind::PodDisruptionBudget => cluster.name_any(),
        ChildKind::ClientService => client_service_name(cluster),
        ChildKind::PeerService => peer_service_name(cluster),
        ChildKind::ConfigMap => configmap_name(cluster),
    }
}

/// Build the desired child object of `kind`.
///
/// `replicas` only affects the StatefulSet.
pub fn desired_child(cluster: &EtcdCluster, kind: ChildKind, replicas: i32) -> ChildObject {
    match kind {
        ChildKind::StatefulSet => {
            let hash = config_hash(&generate_configmap(cluster));
            ChildObject::StatefulSet(Box::new(generate_statefulset(cluster, replicas, &hash)))
        }
        ChildKind::ClientService => {
            ChildObject::ClientService(Box::new(generate_client_service(cluster)))
        }
        ChildKind::PeerService => {
            ChildObject::PeerService(Box::new(generate_peer_service(cluster)))
        }
        ChildKind::ConfigMap => ChildObject::ConfigMap(Box::new(generate_configmap(cluster))),
        ChildKind::PodDisruptionBudget => {
            ChildObject::PodDisruptionBudget(Box::new(generate_pod_disruption_budget(cluster)))
        }
    }
}

/// Ensure one child object matches its desired state.
pub async fn ensure(
    ctx: &Context,
    cluster: &EtcdCluster,
    kind: ChildKind,
    replicas: i32,
) -> Result<(ChildObject, EnsureOutcome)> {
    let fetched = ctx
        .platform
        .get_child(&namespace_of(cluster), kind, &child_name(cluster, kind))
        .await?;
    ensure_fetched(ctx, cluster, kind, replicas, fetched).await
}

/// Like [`ensure`], starting from the object already read this pass.
async fn ensure_fetched(
    ctx: &Context,
    cluster: &EtcdCluster,
    kind: ChildKind,
    replicas: i32,
    fetched: Option<ChildObject>,
) -> Result<(ChildObject, EnsureOutcome)> {
    let namespace = namespace_of(cluster);
    let name = child_name(cluster, kind);
    let desired = desired_child(cluster, kind, replicas);

    let existing = match fetched {
        Some(existing) => existing,
        None => match ctx.platform.create_child(&namespace, &desired).await {
            Ok(created) => {
                info!(kind = %kind, name = %name, "Created child resource");
                return Ok((created, EnsureOutcome::Created));
            }
            Err(e) if e.is_already_exists() => {
                debug!(kind = %kind, name = %name, "Child created concurrently, updating");
                ctx.platform
                    .get_child(&namespace, kind, &name)
                    .await?
                    .ok_or_else(|| {
                        Error::Transient(format!("{kind} {name} vanished after AlreadyExists"))
                    })?
            }
            Err(e) => return Err(e),
        },
    };

    match merge_desired(existing, &desired) {
        Merge::Unchanged(current) => Ok((current, EnsureOutcome::Unchanged)),
        Merge::Changed(updated) => {
            let replaced = ctx.platform.replace_child(&namespace, &updated).await?;
            info!(kind = %kind, name = %name, "Updated child resource");
            Ok((replaced, EnsureOutcome::Updated))
        }
    }
}

enum Merge {
    Unchanged(ChildObject),
    Changed(ChildObject),
}

/// Compare salient fields and, on a mismatch, copy the desired ones onto the
/// fetched object so system-assigned fields survive the replace.
fn merge_desired(existing: ChildObject, desired: &ChildObject) -> Merge {
    match (existing, desired) {
        (ChildObject::StatefulSet(mut current), ChildObject::StatefulSet(want)) => {
            if statefulset_matches(&current, want) {
                return Merge::Unchanged(ChildObject::StatefulSet(current));
            }
            current.metadata.labels = want.metadata.labels.clone();
            if let (Some(spec), Some(want_spec)) = (current.spec.as_mut(), want.spec.as_ref()) {
                spec.replicas = want_spec.replicas;
                spec.selector = want_spec.selector.clone();
                spec.template = want_spec.template.clone();
                spec.persistent_volume_claim_retention_policy =
                    want_spec.persistent_volume_claim_retention_policy.clone();
            } else {
                current.spec = want.spec.clone();
            }
            Merge::Changed(ChildObject::StatefulSet(current))
        }
        (ChildObject::ClientService(current), ChildObject::ClientService(want)) => {
            merge_service(current, want, ChildObject::ClientService)
        }
        (ChildObject::PeerService(current), ChildObject::PeerService(want)) => {
            merge_service(current, want, ChildObject::PeerService)
        }
        (ChildObject::ConfigMap(mut current), ChildObject::ConfigMap(want)) => {
            if current.data == want.data {
                return Merge::Unchanged(ChildObject::ConfigMap(current));
            }
            current.metadata.labels = want.metadata.labels.clone();
            current.data = want.data.clone();
            Merge::Changed(ChildObject::ConfigMap(current))
        }
        (ChildObject::PodDisruptionBudget(mut current), ChildObject::PodDisruptionBudget(want)) => {
            if pdb_matches(&current, want) {
                return Merge::Unchanged(ChildObject::PodDisruptionBudget(current));
            }
            current.metadata.labels = want.metadata.labels.clone();
            if let (Some(spec), Some(want_spec)) = (current.spec.as_mut(), want.spec.as_ref()) {
                spec.max_unavailable = want_spec.max_unavailable.clone();
                spec.selector = want_spec.selector.clone();
            } else {
                current.spec = want.spec.clone();
            }
            Merge::Changed(ChildObject::PodDisruptionBudget(current))
        }
        // get_child returns the kind it was asked for
        (existing, desired) => {
            Merge::Changed(desired.clone().with_resource_version(existing.resource_version()))
        }
    }
}

fn merge_service(
    mut current: Box<Service>,
    want: &Service,
    wrap: fn(Box<Service>) -> ChildObject,
) -> Merge {
    if service_matches(&current, want) {
        return Merge::Unchanged(wrap(current));
    }
    current.metadata.labels = want.metadata.labels.clone();
    if let (Some(spec), Some(want_spec)) = (current.spec.as_mut(), want.spec.as_ref()) {
        spec.ports = want_spec.ports.clone();
        spec.selector = want_spec.selector.clone();
        spec.publish_not_ready_addresses = want_spec.publish_not_ready_addresses;
        if want_spec.type_.is_some() {
            spec.type_ = want_spec.type_.clone();
        }
        if want_spec.cluster_ip.as_deref() == Some("None") {
            spec.cluster_ip = want_spec.cluster_ip.clone();
        }
    } else {
        current.spec = want.spec.clone();
    }
    Merge::Changed(wrap(current))
}

fn statefulset_matches(current: &StatefulSet, want: &StatefulSet) -> bool {
    let (Some(spec), Some(want_spec)) = (current.spec.as_ref(), want.spec.as_ref()) else {
        return false;
    };
    if spec.replicas != want_spec.replicas
        || spec.selector.match_labels != want_spec.selector.match_labels
        || template_config_hash(current) != template_config_hash(want)
    {
        return false;
    }

    match (etcd_container(current), etcd_container(want)) {
        (Some(c), Some(w)) => {
            let ports = |ports: &Option<Vec<k8s_openapi::api::core::v1::ContainerPort>>| {
                ports
                    .as_ref()
                    .map(|ps| {
                        ps.iter()
                            .map(|p| (p.name.clone(), p.container_port))
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default()
            };
            c.image == w.image && ports(&c.ports) == ports(&w.ports) && c.resources == w.resources
        }
        _ => false,
    }
}

fn service_matches(current: &Service, want: &Service) -> bool {
    let (Some(spec), Some(want_spec)) = (current.spec.as_ref(), want.spec.as_ref()) else {
        return false;
    };
    let ports = |s: &k8s_openapi::api::core::v1::ServiceSpec| {
        s.ports
            .as_ref()
            .map(|ps| {
                ps.iter()
                    .map(|p| (p.name.clone(), p.port))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    };
    let headless =
        |s: &k8s_openapi::api::core::v1::ServiceSpec| s.cluster_ip.as_deref() == Some("None");

    ports(spec) == ports(want_spec)
        && spec.selector == want_spec.selector
        && spec.publish_not_ready_addresses.unwrap_or(false)
            == want_spec.publish_not_ready_addresses.unwrap_or(false)
        && headless(spec) == headless(want_spec)
        && (want_spec.type_.is_none() || spec.type_ == want_spec.type_)
}

fn pdb_matches(current: &PodDisruptionBudget, want: &PodDisruptionBudget) -> bool {
    match (current.spec.as_ref(), want.spec.as_ref()) {
        (Some(spec), Some(want_spec)) => {
            spec.max_unavailable == want_spec.max_unavailable
                && spec.selector.as_ref().and_then(|s| s.match_labels.as_ref())
                    == want_spec.selector.as_ref().and_then(|s| s.match_labels.as_ref())
        }
        _ => false,
    }
}

/// Current replica count of the cluster's StatefulSet, if it exists.
pub fn statefulset_replicas(object: &ChildObject) -> Option<i32> {
    object
        .as_statefulset()
        .and_then(|sts| sts.spec.as_ref())
        .and_then(|spec| spec.replicas)
}

/// Ensure every child kind. The StatefulSet keeps its current replica count
/// when it exists, and starts at `initial_replicas` otherwise.
///
/// Returns the StatefulSet replica count after the pass.
pub async fn ensure_all(
    ctx: &Context,
    cluster: &EtcdCluster,
    initial_replicas: i32,
) -> Result<i32> {
    let namespace = namespace_of(cluster);
    let mut replicas = initial_replicas;

    for kind in ChildKind::ALL {
        if kind == ChildKind::StatefulSet {
            let name = child_name(cluster, kind);
            let fetched = ctx.platform.get_child(&namespace, kind, &name).await?;
            if let Some(existing) = &fetched {
                replicas = statefulset_replicas(existing).unwrap_or(0);
            }
            let (object, _) = ensure_fetched(ctx, cluster, kind, replicas, fetched).await?;
            replicas = statefulset_replicas(&object).unwrap_or(replicas);
        } else {
            ensure(ctx, cluster, kind, replicas).await?;
        }
    }
    Ok(replicas)
}
