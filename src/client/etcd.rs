//! `MembershipClient` over the etcd v3 Cluster API.
//!
//! Wraps `etcd_client::Client`. Each call is bounded by the configured
//! request timeout so a wedged member cannot stall a reconciliation pass.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, Member};
use tracing::{debug, instrument};

use crate::client::membership::{
    MemberInfo, MembershipClient, MembershipConnector, MembershipError,
};

/// Default timeout for establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for a single membership request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for any membership request.
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

impl From<&Member> for MemberInfo {
    fn from(member: &Member) -> Self {
        Self {
            id: member.id(),
            name: member.name().to_string(),
            peer_urls: member.peer_urls().to_vec(),
            client_urls: member.client_urls().to_vec(),
        }
    }
}

/// Connected etcd membership client.
#[derive(Clone)]
pub struct EtcdMembershipClient {
    client: Client,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl EtcdMembershipClient {
    /// Connect to the given client endpoints.
    #[instrument(skip_all, fields(endpoints = ?endpoints))]
    pub async fn connect(
        endpoints: &[String],
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, MembershipError> {
        if endpoints.is_empty() {
            return Err(MembershipError::Connection(
                "No endpoints provided".to_string(),
            ));
        }

        let request_timeout = request_timeout.min(MAX_REQUEST_TIMEOUT);
        let options = ConnectOptions::new()
            .with_connect_timeout(connect_timeout)
            .with_timeout(request_timeout);

        let client = bounded("connect", connect_timeout, Client::connect(endpoints, Some(options)))
            .await?;
        debug!("Connected to etcd");

        Ok(Self {
            client,
            connect_timeout,
            request_timeout,
        })
    }
}

#[async_trait]
impl MembershipClient for EtcdMembershipClient {
    #[instrument(skip(self))]
    async fn list_members(&self) -> Result<Vec<MemberInfo>, MembershipError> {
        let mut client = self.client.clone();
        let response =
            bounded("member_list", self.request_timeout, client.member_list()).await?;
        Ok(response.members().iter().map(MemberInfo::from).collect())
    }

    #[instrument(skip(self))]
    async fn add_member(&self, peer_url: &str) -> Result<MemberInfo, MembershipError> {
        let mut client = self.client.clone();
        let urls = vec![peer_url.to_string()];
        let response =
            bounded("member_add", self.request_timeout, client.member_add(urls, None)).await?;
        response.member().map(MemberInfo::from).ok_or_else(|| {
            MembershipError::UnexpectedResponse("member_add returned no member".to_string())
        })
    }

    #[instrument(skip(self), fields(id = %format!("{:x}", id)))]
    async fn remove_member(&self, id: u64) -> Result<(), MembershipError> {
        let mut client = self.client.clone();
        match bounded("member_remove", self.request_timeout, client.member_remove(id)).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_member_not_found() => Err(MembershipError::MemberNotFound(id)),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn health_check(&self, endpoint: &str) -> bool {
        let endpoints = [endpoint.to_string()];
        let probe = match EtcdMembershipClient::connect(
            &endpoints,
            self.connect_timeout,
            self.request_timeout,
        )
        .await
        {
            Ok(probe) => probe,
            Err(e) => {
                debug!(error = %e, "Health check connect failed");
                return false;
            }
        };

        let mut client = probe.client;
        match bounded("status", self.request_timeout, client.status()).await {
            Ok(status) => {
                debug!(version = %status.version(), leader = status.leader(), "Member healthy");
                true
            }
            Err(e) => {
                debug!(error = %e, "Health check failed");
                false
            }
        }
    }
}

/// Builds `EtcdMembershipClient`s with fixed timeouts.
#[derive(Clone, Debug)]
pub struct EtcdConnector {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl Default for EtcdConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT)
    }
}

impl EtcdConnector {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout: request_timeout.min(MAX_REQUEST_TIMEOUT),
        }
    }
}

#[async_trait]
impl MembershipConnector for EtcdConnector {
    async fn connect(
        &self,
        endpoints: &[String],
    ) -> Result<Arc<dyn MembershipClient>, MembershipError> {
        let client =
            EtcdMembershipClient::connect(endpoints, self.connect_timeout, self.request_timeout)
                .await?;
        Ok(Arc::new(client))
    }
}

/// Run an etcd call under a timeout, mapping both failure modes.
async fn bounded<T, F>(operation: &str, duration: Duration, fut: F) -> Result<T, MembershipError>
where
    F: Future<Output = Result<T, etcd_client::Error>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result.map_err(MembershipError::from),
        Err(_) => Err(MembershipError::Timeout {
            operation: operation.to_string(),
            duration,
        }),
    }
}
