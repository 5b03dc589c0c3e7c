//! Node Network Protocol
//!
//! API endpoints and Data Transfer Objects (DTOs) for client requests and
//! internode communication (replica writes, anti-entropy, epoch log replication).
//!
//! Bodies are JSON. Failures are answered with an `ErrorResponse` whose `kind`
//! names the `ClusterError` variant, so the calling side can rebuild the error.

use serde::{Deserialize, Serialize};

use crate::consensus::types::{ApplyState, LogEntry, Role};
use crate::controller::types::StatsSnapshot;
use crate::error::ClusterError;
use crate::merkle::types::EpochTreeObject;
use crate::storage::types::Record;

// --- API Endpoints ---

/// Public endpoint for quorum writes.
pub const ENDPOINT_SET: &str = "/set";
/// Public endpoint for quorum reads. The key follows as a path segment.
pub const ENDPOINT_GET: &str = "/get";
pub const ENDPOINT_HEALTH: &str = "/health";
/// Internal endpoint storing one record on a replica.
pub const ENDPOINT_SET_VALUE: &str = "/internal/set_value";
/// Internal endpoint reading the local version of a key.
pub const ENDPOINT_GET_VALUE: &str = "/internal/get_value";
/// Internal endpoint returning every record of some buckets within an epoch window.
pub const ENDPOINT_STREAM_BUCKETS: &str = "/internal/stream_buckets";
/// Internal endpoint building a partition tree for an epoch window.
pub const ENDPOINT_EPOCH_TREE: &str = "/internal/epoch_tree";
/// Internal endpoint returning the newest tree a replica marked valid.
pub const ENDPOINT_EPOCH_TREE_LAST_VALID: &str = "/internal/epoch_tree_last_valid";
/// Internal endpoint for epoch log replication.
pub const ENDPOINT_APPEND_EPOCH: &str = "/internal/append_epoch";

// --- Data Transfer Objects ---

/// Client write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetRequest {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetResponse {
    pub success: bool,
    /// Epoch the record was stamped with.
    pub epoch: i64,
    /// Replicas that acknowledged before the quorum was reached.
    pub acks: usize,
}

/// Client read result. `value` is `None` when no replica holds the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetResponse {
    pub key: String,
    pub value: Option<String>,
    pub epoch: i64,
    pub timestamp: i64,
}

/// Record sent by the write coordinator to one replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetValueRequest {
    pub partition: u32,
    pub record: Record,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetValueResponse {
    /// False when the replica already held this exact version.
    pub written: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetValueResponse {
    pub record: Option<Record>,
}

/// Pulls records from a replica during Sync.
///
/// An empty `buckets` list means every bucket of the partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamBucketsRequest {
    pub partition: u32,
    pub buckets: Vec<u32>,
    pub lower_epoch: i64,
    pub upper_epoch: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamBucketsResponse {
    pub records: Vec<Record>,
}

/// Asks a replica for its tree over `[lower_epoch, upper_epoch)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochTreeRequest {
    pub partition: u32,
    pub lower_epoch: i64,
    pub upper_epoch: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochTreeLastValidResponse {
    pub tree: Option<EpochTreeObject>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEpochRequest {
    pub leader: String,
    pub entry: LogEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub member: String,
    pub healthy: bool,
    pub epoch: i64,
    pub apply_state: ApplyState,
    pub role: Role,
    pub leader: Option<String>,
    pub ring_members: usize,
    pub active_partitions: usize,
    pub queued_work: usize,
    pub stats: StatsSnapshot,
    /// Reason the node reports itself unhealthy, if any.
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: String,
    pub message: String,
}

impl From<&ClusterError> for ErrorResponse {
    fn from(err: &ClusterError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}
