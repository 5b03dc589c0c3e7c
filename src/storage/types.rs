use serde::{Deserialize, Serialize};

/// A single versioned value. Written once per `(key, epoch)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub value: Vec<u8>,
    /// Cluster epoch the write was accepted in.
    pub epoch: i64,
    /// Wall-clock milliseconds at the coordinator.
    pub timestamp: i64,
}

impl Record {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>, epoch: i64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            epoch,
            timestamp: now_ms(),
        }
    }

    /// `(epoch, timestamp)` ordering used for last-writer-wins.
    pub fn version(&self) -> (i64, i64) {
        (self.epoch, self.timestamp)
    }

    pub fn is_older_than(&self, other: &Record) -> bool {
        self.version() < other.version()
    }

    pub fn encode(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }
}

/// Helper to get the current system time in milliseconds.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
