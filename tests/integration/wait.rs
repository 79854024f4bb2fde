//! Watch-based condition waiting utilities.

use std::fmt::Debug;
use std::time::Duration;

use futures::StreamExt;
use kube::Resource;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use tokio::time::timeout;

use etcd_operator::crd::{ClusterPhase, EtcdCluster};

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("Timeout waiting for condition after {0:?}")]
    Timeout(Duration),

    #[error("Resource was deleted while waiting")]
    ResourceDeleted,

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Watcher error: {0}")]
    WatcherError(#[from] watcher::Error),

    #[error("Watch stream ended unexpectedly")]
    StreamEnded,
}

/// Wait for a named resource to satisfy `condition`.
pub async fn wait_for_condition<K, F>(
    api: &Api<K>,
    name: &str,
    condition: F,
    timeout_duration: Duration,
) -> Result<K, WaitError>
where
    K: Resource + Clone + Debug + Send + 'static,
    K: serde::de::DeserializeOwned,
    <K as Resource>::DynamicType: Default,
    F: Fn(&K) -> bool,
{
    let watch_future = async {
        if let Ok(resource) = api.get(name).await
            && condition(&resource)
        {
            return Ok(resource);
        }

        let mut stream = watcher::watcher(
            api.clone(),
            watcher::Config::default().fields(&format!("metadata.name={}", name)),
        )
        .boxed();

        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Apply(resource)) | Ok(Event::InitApply(resource)) => {
                    if condition(&resource) {
                        return Ok(resource);
                    }
                }
                Ok(Event::Delete(_)) => return Err(WaitError::ResourceDeleted),
                Ok(Event::Init) | Ok(Event::InitDone) => {}
                Err(e) => return Err(WaitError::WatcherError(e)),
            }
        }

        Err(WaitError::StreamEnded)
    };

    timeout(timeout_duration, watch_future)
        .await
        .map_err(|_| WaitError::Timeout(timeout_duration))?
}

/// Wait until a named resource no longer exists.
pub async fn wait_for_deletion<K>(
    api: &Api<K>,
    name: &str,
    timeout_duration: Duration,
) -> Result<(), WaitError>
where
    K: Resource + Clone + Debug + Send + 'static,
    K: serde::de::DeserializeOwned,
    <K as Resource>::DynamicType: Default,
{
    let wait_future = async {
        match api.get(name).await {
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(WaitError::KubeError(e)),
            Ok(_) => {}
        }

        let mut stream = watcher::watcher(
            api.clone(),
            watcher::Config::default().fields(&format!("metadata.name={}", name)),
        )
        .boxed();

        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Delete(_)) => return Ok(()),
                Ok(_) => continue,
                Err(e) => return Err(WaitError::WatcherError(e)),
            }
        }

        Err(WaitError::StreamEnded)
    };

    timeout(timeout_duration, wait_future)
        .await
        .map_err(|_| WaitError::Timeout(timeout_duration))?
}

pub fn is_phase(cluster: &EtcdCluster, phase: ClusterPhase) -> bool {
    cluster.status.as_ref().is_some_and(|s| s.phase == phase)
}

/// Running with every member ready and the latest generation observed.
pub fn is_converged(cluster: &EtcdCluster) -> bool {
    cluster.status.as_ref().is_some_and(|s| {
        s.phase == ClusterPhase::Running
            && s.ready_members >= cluster.spec.members
            && s.observed_generation == cluster.metadata.generation
    })
}

pub async fn wait_for_phase(
    api: &Api<EtcdCluster>,
    name: &str,
    phase: ClusterPhase,
    timeout_duration: Duration,
) -> Result<EtcdCluster, WaitError> {
    wait_for_condition(api, name, |c| is_phase(c, phase), timeout_duration).await
}

pub async fn wait_for_converged(
    api: &Api<EtcdCluster>,
    name: &str,
    timeout_duration: Duration,
) -> Result<EtcdCluster, WaitError> {
    wait_for_condition(api, name, is_converged, timeout_duration).await
}
