//! Per-cluster cache of connected membership clients.
//!
//! Keyed by `<namespace>/<name>`. A cached client is reused while its
//! endpoint set is unchanged and is dropped on `release` (cluster deletion).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::client::membership::{MembershipClient, MembershipConnector, MembershipError};

struct Entry {
    endpoints: Vec<String>,
    client: Arc<dyn MembershipClient>,
}

/// Connected clients shared across reconciliation passes.
pub struct MembershipClients {
    connector: Arc<dyn MembershipConnector>,
    clients: RwLock<HashMap<String, Entry>>,
}

impl MembershipClients {
    pub fn new(connector: Arc<dyn MembershipConnector>) -> Self {
        Self {
            connector,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Return a client for `key`, connecting if none is cached or the
    /// endpoints changed since the last connect.
    pub async fn get(
        &self,
        key: &str,
        endpoints: &[String],
    ) -> Result<Arc<dyn MembershipClient>, MembershipError> {
        {
            let clients = self.clients.read().await;
            if let Some(entry) = clients.get(key)
                && entry.endpoints == endpoints
            {
                return Ok(entry.client.clone());
            }
        }

        let client = self.connector.connect(endpoints).await?;
        debug!(cluster = %key, "Cached new membership client");
        self.clients.write().await.insert(
            key.to_string(),
            Entry {
                endpoints: endpoints.to_vec(),
                client: client.clone(),
            },
        );
        Ok(client)
    }

    /// Drop the cached client for `key`. Returns whether one was cached.
    pub async fn release(&self, key: &str) -> bool {
        let removed = self.clients.write().await.remove(key).is_some();
        if removed {
            debug!(cluster = %key, "Released membership client");
        }
        removed
    }

    /// Number of cached clients.
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}
