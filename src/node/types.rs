use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::error::{ClusterError, Result};
use crate::merkle::types::EpochTreeObject;
use crate::storage::types::Record;
use crate::transport::protocol::{
    AppendEpochRequest, EpochTreeRequest, HealthResponse, SetResponse, StreamBucketsRequest,
};

pub type Reply<T> = oneshot::Sender<Result<T>>;

/// Every request a node serves, client-facing and internal alike.
#[derive(Debug)]
pub enum NodeRequest {
    /// Quorum write coordinated by this node.
    Set {
        key: String,
        value: Vec<u8>,
        reply: Reply<SetResponse>,
    },
    /// Quorum read coordinated by this node.
    Get { key: String, reply: Reply<Record> },
    SetValue {
        partition: u32,
        record: Record,
        reply: Reply<bool>,
    },
    GetValue {
        key: String,
        reply: Reply<Option<Record>>,
    },
    StreamBuckets {
        request: StreamBucketsRequest,
        reply: Reply<Vec<Record>>,
    },
    EpochTree {
        request: EpochTreeRequest,
        reply: Reply<EpochTreeObject>,
    },
    EpochTreeLastValid {
        partition: u32,
        reply: Reply<Option<EpochTreeObject>>,
    },
    AppendEpoch {
        request: AppendEpochRequest,
        reply: Reply<()>,
    },
    Health { reply: Reply<HealthResponse> },
}

/// Handle for submitting requests into a node's request loop.
///
/// Both the hand-off and the wait for the answer are bounded. The answer may take
/// longer than a plain hand-off because the node can be waiting on its own quorum.
#[derive(Clone, Debug)]
pub struct RequestSender {
    member: String,
    tx: mpsc::Sender<NodeRequest>,
    send_timeout: Duration,
    reply_timeout: Duration,
}

impl RequestSender {
    pub fn new(member: impl Into<String>, tx: mpsc::Sender<NodeRequest>, timeout: Duration) -> Self {
        Self {
            member: member.into(),
            tx,
            send_timeout: timeout,
            reply_timeout: timeout * 2,
        }
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> NodeRequest) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send_timeout(build(reply_tx), self.send_timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => ClusterError::Timeout(format!(
                    "request channel of {} stayed full for {:?}",
                    self.member, self.send_timeout
                )),
                mpsc::error::SendTimeoutError::Closed(_) => {
                    ClusterError::unreachable(&self.member, "request loop stopped")
                }
            })?;

        match tokio::time::timeout(self.reply_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClusterError::unreachable(
                &self.member,
                "request dropped without a reply",
            )),
            Err(_) => Err(ClusterError::Timeout(format!(
                "{} did not answer within {:?}",
                self.member, self.reply_timeout
            ))),
        }
    }
}
