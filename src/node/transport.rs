use std::sync::Arc;

use async_trait::async_trait;

use crate::consensus::log::LogTransport;
use crate::consensus::types::LogEntry;
use crate::error::{ClusterError, Result};
use crate::ring::hashring::HashRing;
use crate::transport::client::{ClientManager, cluster_error};
use crate::transport::protocol::AppendEpochRequest;

/// Replicates epoch log entries to every ring member through the peer clients.
pub struct PeerLogTransport {
    ring: Arc<HashRing>,
    clients: Arc<ClientManager>,
}

impl PeerLogTransport {
    pub fn new(ring: Arc<HashRing>, clients: Arc<ClientManager>) -> Self {
        Self { ring, clients }
    }
}

#[async_trait]
impl LogTransport for PeerLogTransport {
    fn peers(&self, leader: &str) -> Vec<String> {
        self.ring
            .members()
            .into_iter()
            .filter(|member| member != leader)
            .collect()
    }

    async fn append(&self, peer: &str, leader: &str, entry: LogEntry) -> Result<()> {
        let client = self.clients.get(peer)?;
        let request = AppendEpochRequest {
            leader: leader.to_string(),
            entry,
        };
        client.append_epoch(request).await.map_err(|e| match cluster_error(&e) {
            Some(ClusterError::Stale(message)) => ClusterError::Stale(message.clone()),
            Some(ClusterError::Timeout(message)) => ClusterError::Timeout(message.clone()),
            _ => ClusterError::unreachable(peer, e),
        })
    }
}
