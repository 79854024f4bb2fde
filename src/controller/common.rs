//! Shared controller helpers.

use kube::{Api, Resource, ResourceExt, api::PatchParams};
use serde::de::DeserializeOwned;

use crate::controller::error::Error;
use crate::crd::EtcdCluster;

/// Key identifying a cluster across reconciliations (`<namespace>/<name>`).
pub fn cluster_key(cluster: &EtcdCluster) -> String {
    format!(
        "{}/{}",
        cluster.namespace().unwrap_or_default(),
        cluster.name_any()
    )
}

/// Whether the cluster carries the given finalizer.
pub fn has_finalizer(cluster: &EtcdCluster, finalizer: &str) -> bool {
    cluster.finalizers().iter().any(|f| f == finalizer)
}

async fn patch_finalizers<T>(api: &Api<T>, name: &str, finalizers: Vec<String>) -> Result<(), Error>
where
    T: Resource + Clone + DeserializeOwned + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(
        name,
        &PatchParams::default(),
        &kube::api::Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Add a finalizer to a resource.
pub async fn add_finalizer<T>(api: &Api<T>, name: &str, finalizer: &str) -> Result<(), Error>
where
    T: Resource + Clone + DeserializeOwned + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let resource = api.get(name).await?;
    let mut finalizers = resource.finalizers().to_vec();

    if !finalizers.iter().any(|f| f == finalizer) {
        finalizers.push(finalizer.to_string());
        patch_finalizers(api, name, finalizers).await?;
    }
    Ok(())
}

/// Remove a finalizer from a resource. A missing resource is not an error.
pub async fn remove_finalizer<T>(api: &Api<T>, name: &str, finalizer: &str) -> Result<(), Error>
where
    T: Resource + Clone + DeserializeOwned + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let resource = match api.get(name).await {
        Ok(r) => r,
        Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let finalizers = resource.finalizers().to_vec();
    if finalizers.iter().any(|f| f == finalizer) {
        let remaining = finalizers.into_iter().filter(|f| f != finalizer).collect();
        patch_finalizers(api, name, remaining).await?;
    }
    Ok(())
}
