//! Platform API seam.
//!
//! Every Kubernetes call the controller makes goes through `PlatformApi`, so
//! reconciliation can run against the real API server (`KubePlatform`) or an
//! in-memory fake in tests.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::controller::common;
use crate::controller::error::{Error, Result};
use crate::crd::{EtcdCluster, EtcdClusterStatus};

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "etcd-operator";

/// Kinds of child object the controller owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChildKind {
    StatefulSet,
    ClientService,
    PeerService,
    ConfigMap,
    PodDisruptionBudget,
}

impl ChildKind {
    /// Kinds in the order they are ensured.
    pub const ALL: [ChildKind; 5] = [
        ChildKind::ConfigMap,
        ChildKind::PeerService,
        ChildKind::ClientService,
        ChildKind::StatefulSet,
        ChildKind::PodDisruptionBudget,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChildKind::StatefulSet => "StatefulSet",
            ChildKind::ClientService => "ClientService",
            ChildKind::PeerService => "PeerService",
            ChildKind::ConfigMap => "ConfigMap",
            ChildKind::PodDisruptionBudget => "PodDisruptionBudget",
        }
    }
}

impl std::fmt::Display for ChildKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A child object of one of the owned kinds.
#[derive(Clone, Debug, PartialEq)]
pub enum ChildObject {
    StatefulSet(Box<StatefulSet>),
    ClientService(Box<Service>),
    PeerService(Box<Service>),
    ConfigMap(Box<ConfigMap>),
    PodDisruptionBudget(Box<PodDisruptionBudget>),
}

impl ChildObject {
    pub fn kind(&self) -> ChildKind {
        match self {
            ChildObject::StatefulSet(_) => ChildKind::StatefulSet,
            ChildObject::ClientService(_) => ChildKind::ClientService,
            ChildObject::PeerService(_) => ChildKind::PeerService,
            ChildObject::ConfigMap(_) => ChildKind::ConfigMap,
            ChildObject::PodDisruptionBudget(_) => ChildKind::PodDisruptionBudget,
        }
    }

    pub fn name(&self) -> String {
        match self {
            ChildObject::StatefulSet(o) => o.name_any(),
            ChildObject::ClientService(o) | ChildObject::PeerService(o) => o.name_any(),
            ChildObject::ConfigMap(o) => o.name_any(),
            ChildObject::PodDisruptionBudget(o) => o.name_any(),
        }
    }

    pub fn resource_version(&self) -> Option<String> {
        match self {
            ChildObject::StatefulSet(o) => o.resource_version(),
            ChildObject::ClientService(o) | ChildObject::PeerService(o) => o.resource_version(),
            ChildObject::ConfigMap(o) => o.resource_version(),
            ChildObject::PodDisruptionBudget(o) => o.resource_version(),
        }
    }

    /// Set the resourceVersion the next replace is conditioned on.
    pub fn with_resource_version(mut self, resource_version: Option<String>) -> Self {
        let meta = match &mut self {
            ChildObject::StatefulSet(o) => &mut o.metadata,
            ChildObject::ClientService(o) | ChildObject::PeerService(o) => &mut o.metadata,
            ChildObject::ConfigMap(o) => &mut o.metadata,
            ChildObject::PodDisruptionBudget(o) => &mut o.metadata,
        };
        meta.resource_version = resource_version;
        self
    }

    /// The StatefulSet, if this is one.
    pub fn as_statefulset(&self) -> Option<&StatefulSet> {
        match self {
            ChildObject::StatefulSet(o) => Some(o),
            _ => None,
        }
    }
}

/// Kubernetes operations used by the controller.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// Fetch a child object. `Ok(None)` when it does not exist.
    async fn get_child(
        &self,
        namespace: &str,
        kind: ChildKind,
        name: &str,
    ) -> Result<Option<ChildObject>>;

    /// Create a child object.
    async fn create_child(&self, namespace: &str, object: &ChildObject) -> Result<ChildObject>;

    /// Replace a child object. The object carries the resourceVersion it was read at.
    async fn replace_child(&self, namespace: &str, object: &ChildObject) -> Result<ChildObject>;

    /// Set the replica count of a StatefulSet.
    async fn patch_statefulset_replicas(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<()>;

    /// List pods matching a label selector.
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    /// Write the cluster status, guarded by the cluster's resourceVersion.
    async fn patch_status(&self, cluster: &EtcdCluster, status: &EtcdClusterStatus) -> Result<()>;

    async fn add_finalizer(&self, cluster: &EtcdCluster, finalizer: &str) -> Result<()>;

    async fn remove_finalizer(&self, cluster: &EtcdCluster, finalizer: &str) -> Result<()>;

    /// Delete PVCs matching a label selector. Returns how many were deleted.
    async fn delete_pvcs(&self, namespace: &str, selector: &str) -> Result<usize>;

    /// Publish an event on the cluster. Failures are logged, never returned.
    async fn publish_event(
        &self,
        cluster: &EtcdCluster,
        event_type: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// `PlatformApi` backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
    reporter: Reporter,
}

impl KubePlatform {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }

    async fn get_opt<K>(&self, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create<K>(&self, namespace: &str, object: &K) -> Result<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + Serialize
            + DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&Self::post_params(), object).await?)
    }

    async fn replace<K>(&self, namespace: &str, object: &K) -> Result<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + Serialize
            + DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let name = object
            .meta()
            .name
            .clone()
            .ok_or_else(|| Error::MissingField("metadata.name".to_string()))?;
        Ok(api.replace(&name, &Self::post_params(), object).await?)
    }
}

#[async_trait]
impl PlatformApi for KubePlatform {
    async fn get_child(
        &self,
        namespace: &str,
        kind: ChildKind,
        name: &str,
    ) -> Result<Option<ChildObject>> {
        let object = match kind {
            ChildKind::StatefulSet => self
                .get_opt::<StatefulSet>(namespace, name)
                .await?
                .map(|o| ChildObject::StatefulSet(Box::new(o))),
            ChildKind::ClientService => self
                .get_opt::<Service>(namespace, name)
                .await?
                .map(|o| ChildObject::ClientService(Box::new(o))),
            ChildKind::PeerService => self
                .get_opt::<Service>(namespace, name)
                .await?
                .map(|o| ChildObject::PeerService(Box::new(o))),
            ChildKind::ConfigMap => self
                .get_opt::<ConfigMap>(namespace, name)
                .await?
                .map(|o| ChildObject::ConfigMap(Box::new(o))),
            ChildKind::PodDisruptionBudget => self
                .get_opt::<PodDisruptionBudget>(namespace, name)
                .await?
                .map(|o| ChildObject::PodDisruptionBudget(Box::new(o))),
        };
        Ok(object)
    }

    async fn create_child(&self, namespace: &str, object: &ChildObject) -> Result<ChildObject> {
        Ok(match object {
            ChildObject::StatefulSet(o) => {
                ChildObject::StatefulSet(Box::new(self.create(namespace, o.as_ref()).await?))
            }
            ChildObject::ClientService(o) => {
                ChildObject::ClientService(Box::new(self.create(namespace, o.as_ref()).await?))
            }
            ChildObject::PeerService(o) => {
                ChildObject::PeerService(Box::new(self.create(namespace, o.as_ref()).await?))
            }
            ChildObject::ConfigMap(o) => {
                ChildObject::ConfigMap(Box::new(self.create(namespace, o.as_ref()).await?))
            }
            ChildObject::PodDisruptionBudget(o) => ChildObject::PodDisruptionBudget(Box::new(
                self.create(namespace, o.as_ref()).await?,
            )),
        })
    }

    async fn replace_child(&self, namespace: &str, object: &ChildObject) -> Result<ChildObject> {
        Ok(match object {
            ChildObject::StatefulSet(o) => {
                ChildObject::StatefulSet(Box::new(self.replace(namespace, o.as_ref()).await?))
            }
            ChildObject::ClientService(o) => {
                ChildObject::ClientService(Box::new(self.replace(namespace, o.as_ref()).await?))
            }
            ChildObject::PeerService(o) => {
                ChildObject::PeerService(Box::new(self.replace(namespace, o.as_ref()).await?))
            }
            ChildObject::ConfigMap(o) => {
                ChildObject::ConfigMap(Box::new(self.replace(namespace, o.as_ref()).await?))
            }
            ChildObject::PodDisruptionBudget(o) => ChildObject::PodDisruptionBudget(Box::new(
                self.replace(namespace, o.as_ref()).await?,
            )),
        })
    }

    async fn patch_statefulset_replicas(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<()> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "spec": {
                "replicas": replicas
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default().labels(selector)).await?;
        Ok(pods.items)
    }

    async fn patch_status(&self, cluster: &EtcdCluster, status: &EtcdClusterStatus) -> Result<()> {
        let namespace = cluster
            .namespace()
            .ok_or_else(|| Error::MissingField("metadata.namespace".to_string()))?;
        let api: Api<EtcdCluster> = Api::namespaced(self.client.clone(), &namespace);

        // A stale resourceVersion makes the API server answer 409.
        let patch = match cluster.resource_version() {
            Some(rv) => serde_json::json!({
                "metadata": { "resourceVersion": rv },
                "status": status
            }),
            None => serde_json::json!({ "status": status }),
        };
        api.patch_status(
            &cluster.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn add_finalizer(&self, cluster: &EtcdCluster, finalizer: &str) -> Result<()> {
        let namespace = cluster
            .namespace()
            .ok_or_else(|| Error::MissingField("metadata.namespace".to_string()))?;
        let api: Api<EtcdCluster> = Api::namespaced(self.client.clone(), &namespace);
        common::add_finalizer(&api, &cluster.name_any(), finalizer).await
    }

    async fn remove_finalizer(&self, cluster: &EtcdCluster, finalizer: &str) -> Result<()> {
        let namespace = cluster
            .namespace()
            .ok_or_else(|| Error::MissingField("metadata.namespace".to_string()))?;
        let api: Api<EtcdCluster> = Api::namespaced(self.client.clone(), &namespace);
        common::remove_finalizer(&api, &cluster.name_any(), finalizer).await
    }

    async fn delete_pvcs(&self, namespace: &str, selector: &str) -> Result<usize> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let pvcs = api.list(&ListParams::default().labels(selector)).await?;
        let mut deleted = 0;
        for pvc in pvcs.items {
            let name = pvc.name_any();
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => {
                    debug!(pvc = %name, "Deleted PVC");
                    deleted += 1;
                }
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(deleted)
    }

    async fn publish_event(
        &self,
        cluster: &EtcdCluster,
        event_type: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone());
        let object_ref = cluster.object_ref(&());
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_: event_type,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }
}
