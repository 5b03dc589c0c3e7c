use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use super::client::{PeerClient, PeerConnector};
use super::protocol::{AppendEpochRequest, EpochTreeRequest, HealthResponse, StreamBucketsRequest};
use crate::error::ClusterError;
use crate::membership::types::MemberInfo;
use crate::merkle::types::EpochTreeObject;
use crate::node::types::{NodeRequest, RequestSender};
use crate::storage::types::Record;

/// In-process network: member name to request channel.
///
/// Members can be cut off with `disconnect` to simulate an unreachable peer.
#[derive(Default)]
pub struct LocalNetwork {
    nodes: DashMap<String, RequestSender>,
    disconnected: DashSet<String>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, sender: RequestSender) {
        self.nodes.insert(sender.member().to_string(), sender);
    }

    pub fn unregister(&self, member: &str) {
        self.nodes.remove(member);
    }

    pub fn disconnect(&self, member: &str) {
        self.disconnected.insert(member.to_string());
    }

    pub fn reconnect(&self, member: &str) {
        self.disconnected.remove(member);
    }

    fn sender(&self, member: &str) -> crate::error::Result<RequestSender> {
        if self.disconnected.contains(member) {
            return Err(ClusterError::unreachable(member, "disconnected"));
        }
        self.nodes
            .get(member)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ClusterError::unreachable(member, "not registered"))
    }
}

pub struct LocalPeerClient {
    member: String,
    network: Arc<LocalNetwork>,
}

impl LocalPeerClient {
    pub fn new(member: impl Into<String>, network: Arc<LocalNetwork>) -> Self {
        Self {
            member: member.into(),
            network,
        }
    }
}

#[async_trait]
impl PeerClient for LocalPeerClient {
    fn member(&self) -> &str {
        &self.member
    }

    async fn set_value(&self, partition: u32, record: &Record) -> Result<bool> {
        let record = record.clone();
        let sender = self.network.sender(&self.member)?;
        Ok(sender
            .call(|reply| NodeRequest::SetValue {
                partition,
                record,
                reply,
            })
            .await?)
    }

    async fn get_value(&self, key: &str) -> Result<Option<Record>> {
        let key = key.to_string();
        let sender = self.network.sender(&self.member)?;
        Ok(sender.call(|reply| NodeRequest::GetValue { key, reply }).await?)
    }

    async fn stream_buckets(&self, request: StreamBucketsRequest) -> Result<Vec<Record>> {
        let sender = self.network.sender(&self.member)?;
        Ok(sender
            .call(|reply| NodeRequest::StreamBuckets { request, reply })
            .await?)
    }

    async fn epoch_tree(&self, request: EpochTreeRequest) -> Result<EpochTreeObject> {
        let sender = self.network.sender(&self.member)?;
        Ok(sender
            .call(|reply| NodeRequest::EpochTree { request, reply })
            .await?)
    }

    async fn epoch_tree_last_valid(&self, partition: u32) -> Result<Option<EpochTreeObject>> {
        let sender = self.network.sender(&self.member)?;
        Ok(sender
            .call(|reply| NodeRequest::EpochTreeLastValid { partition, reply })
            .await?)
    }

    async fn append_epoch(&self, request: AppendEpochRequest) -> Result<()> {
        let sender = self.network.sender(&self.member)?;
        Ok(sender
            .call(|reply| NodeRequest::AppendEpoch { request, reply })
            .await?)
    }

    async fn health(&self) -> Result<HealthResponse> {
        let sender = self.network.sender(&self.member)?;
        Ok(sender.call(|reply| NodeRequest::Health { reply }).await?)
    }
}

pub struct LocalConnector {
    network: Arc<LocalNetwork>,
}

impl LocalConnector {
    pub fn new(network: Arc<LocalNetwork>) -> Self {
        Self { network }
    }
}

impl PeerConnector for LocalConnector {
    fn connect(&self, member: &MemberInfo) -> Result<Arc<dyn PeerClient>> {
        Ok(Arc::new(LocalPeerClient::new(
            member.name.clone(),
            Arc::clone(&self.network),
        )))
    }
}
