use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::protocol::{
    AppendEpochRequest, ENDPOINT_APPEND_EPOCH, ENDPOINT_EPOCH_TREE, ENDPOINT_EPOCH_TREE_LAST_VALID,
    ENDPOINT_GET_VALUE, ENDPOINT_HEALTH, ENDPOINT_SET_VALUE, ENDPOINT_STREAM_BUCKETS,
    EpochTreeLastValidResponse, EpochTreeRequest, ErrorResponse, GetValueResponse, HealthResponse,
    SetValueRequest, SetValueResponse, StreamBucketsRequest, StreamBucketsResponse,
};
use crate::error::ClusterError;
use crate::membership::types::MemberInfo;
use crate::merkle::types::EpochTreeObject;
use crate::storage::types::Record;

/// Requests one node can make of another.
///
/// Errors are `anyhow` errors wrapping a `ClusterError` whenever the remote side
/// answered with one, so callers can `downcast_ref::<ClusterError>()`.
#[async_trait]
pub trait PeerClient: Send + Sync {
    fn member(&self) -> &str;

    /// Stores `record` on the peer. Returns whether the peer wrote anything.
    async fn set_value(&self, partition: u32, record: &Record) -> Result<bool>;

    async fn get_value(&self, key: &str) -> Result<Option<Record>>;

    async fn stream_buckets(&self, request: StreamBucketsRequest) -> Result<Vec<Record>>;

    async fn epoch_tree(&self, request: EpochTreeRequest) -> Result<EpochTreeObject>;

    async fn epoch_tree_last_valid(&self, partition: u32) -> Result<Option<EpochTreeObject>>;

    async fn append_epoch(&self, request: AppendEpochRequest) -> Result<()>;

    async fn health(&self) -> Result<HealthResponse>;
}

/// Creates clients for members announced by the membership layer.
pub trait PeerConnector: Send + Sync {
    fn connect(&self, member: &MemberInfo) -> Result<Arc<dyn PeerClient>>;
}

/// `ClusterError` carried by an `anyhow` error, if any.
pub fn cluster_error(err: &anyhow::Error) -> Option<&ClusterError> {
    err.downcast_ref::<ClusterError>()
}

// ============================================================
// HTTP CLIENT
// ============================================================

pub struct HttpPeerClient {
    member: String,
    base_url: String,
    http_client: reqwest::Client,
    timeout: Duration,
    attempts: usize,
}

impl HttpPeerClient {
    pub fn new(member: impl Into<String>, http_addr: std::net::SocketAddr, timeout: Duration) -> Self {
        Self::with_client(member, http_addr, timeout, reqwest::Client::new())
    }

    pub fn with_client(
        member: impl Into<String>,
        http_addr: std::net::SocketAddr,
        timeout: Duration,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            member: member.into(),
            base_url: format!("http://{}", http_addr),
            http_client,
            timeout,
            attempts: 3,
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    async fn post_with_retry<T: Serialize>(&self, url: String, payload: &T) -> Result<reqwest::Response> {
        let mut delay_ms = 150u64;

        for attempt in 0..self.attempts {
            let response = self
                .http_client
                .post(url.clone())
                .json(payload)
                .timeout(self.timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == self.attempts {
                        return Err(self.transport_error(e));
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(ClusterError::unreachable(&self.member, "retry attempts exhausted").into())
    }

    async fn get_with_retry(&self, url: String) -> Result<reqwest::Response> {
        let mut delay_ms = 150u64;

        for attempt in 0..self.attempts {
            let response = self
                .http_client
                .get(url.clone())
                .timeout(self.timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == self.attempts {
                        return Err(self.transport_error(e));
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(ClusterError::unreachable(&self.member, "retry attempts exhausted").into())
    }

    fn transport_error(&self, err: reqwest::Error) -> anyhow::Error {
        if err.is_timeout() {
            ClusterError::Timeout(format!("request to {}: {}", self.member, err)).into()
        } else {
            ClusterError::unreachable(&self.member, err).into()
        }
    }

    /// Decodes a success body, or rebuilds the peer's `ClusterError`.
    async fn decode<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }
        match response.json::<ErrorResponse>().await {
            Ok(body) => Err(ClusterError::from_kind(&body.kind, body.message, &self.member).into()),
            Err(_) => Err(anyhow::anyhow!("{} answered {}", self.member, status)),
        }
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    fn member(&self) -> &str {
        &self.member
    }

    async fn set_value(&self, partition: u32, record: &Record) -> Result<bool> {
        let payload = SetValueRequest {
            partition,
            record: record.clone(),
        };
        let response = self.post_with_retry(self.url(ENDPOINT_SET_VALUE), &payload).await?;
        let body: SetValueResponse = self.decode(response).await?;
        Ok(body.written)
    }

    async fn get_value(&self, key: &str) -> Result<Option<Record>> {
        let url = format!("{}/{}", self.url(ENDPOINT_GET_VALUE), key);
        let response = self.get_with_retry(url).await?;
        let body: GetValueResponse = self.decode(response).await?;
        Ok(body.record)
    }

    async fn stream_buckets(&self, request: StreamBucketsRequest) -> Result<Vec<Record>> {
        let response = self
            .post_with_retry(self.url(ENDPOINT_STREAM_BUCKETS), &request)
            .await?;
        let body: StreamBucketsResponse = self.decode(response).await?;
        Ok(body.records)
    }

    async fn epoch_tree(&self, request: EpochTreeRequest) -> Result<EpochTreeObject> {
        let response = self.post_with_retry(self.url(ENDPOINT_EPOCH_TREE), &request).await?;
        self.decode(response).await
    }

    async fn epoch_tree_last_valid(&self, partition: u32) -> Result<Option<EpochTreeObject>> {
        let url = format!("{}/{}", self.url(ENDPOINT_EPOCH_TREE_LAST_VALID), partition);
        let response = self.get_with_retry(url).await?;
        let body: EpochTreeLastValidResponse = self.decode(response).await?;
        Ok(body.tree)
    }

    async fn append_epoch(&self, request: AppendEpochRequest) -> Result<()> {
        let response = self
            .post_with_retry(self.url(ENDPOINT_APPEND_EPOCH), &request)
            .await?;
        let _: serde_json::Value = self.decode(response).await?;
        Ok(())
    }

    async fn health(&self) -> Result<HealthResponse> {
        let response = self.get_with_retry(self.url(ENDPOINT_HEALTH)).await?;
        self.decode(response).await
    }
}

/// Connects to members over HTTP at their advertised address.
pub struct HttpConnector {
    http_client: reqwest::Client,
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            timeout,
        }
    }
}

impl PeerConnector for HttpConnector {
    fn connect(&self, member: &MemberInfo) -> Result<Arc<dyn PeerClient>> {
        Ok(Arc::new(HttpPeerClient::with_client(
            member.name.clone(),
            member.http_addr,
            self.timeout,
            self.http_client.clone(),
        )))
    }
}

// ============================================================
// CLIENT MANAGER
// ============================================================

/// One client per known ring member, kept in step with membership events.
pub struct ClientManager {
    connector: Arc<dyn PeerConnector>,
    clients: DashMap<String, Arc<dyn PeerClient>>,
}

impl ClientManager {
    pub fn new(connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            connector,
            clients: DashMap::new(),
        }
    }

    /// Adds or replaces the client for `member`.
    pub fn add_member(&self, member: &MemberInfo) -> Result<()> {
        let client = self.connector.connect(member)?;
        self.clients.insert(member.name.clone(), client);
        tracing::debug!("Client registered for {} at {}", member.name, member.http_addr);
        Ok(())
    }

    pub fn remove_member(&self, name: &str) -> bool {
        self.clients.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> crate::error::Result<Arc<dyn PeerClient>> {
        self.clients
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ClusterError::unreachable(name, "no client for member"))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.clients.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
