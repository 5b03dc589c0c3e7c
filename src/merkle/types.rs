use serde::{Deserialize, Serialize};

/// Wire and persisted form of a partition tree for the epoch window `[lower_epoch, upper_epoch)`.
///
/// Only the bucket accumulators travel; the receiver rebuilds the inner nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochTreeObject {
    pub partition: u32,
    pub lower_epoch: i64,
    pub upper_epoch: i64,
    pub buckets: Vec<u64>,
    /// Set once enough replicas agreed on this tree.
    pub valid: bool,
}

impl EpochTreeObject {
    /// The epoch this object is filed under: the last epoch the window covers.
    pub fn epoch(&self) -> i64 {
        self.upper_epoch - 1
    }

    pub fn covers_same_window(&self, other: &EpochTreeObject) -> bool {
        self.partition == other.partition
            && self.lower_epoch == other.lower_epoch
            && self.upper_epoch == other.upper_epoch
    }
}
