use std::sync::Arc;

use super::hash::BucketHash;
use super::tree::MerkleTree;
use super::types::EpochTreeObject;
use crate::error::{ClusterError, Result};
use crate::storage::records::RecordStore;

/// Builds, persists and loads partition trees over the epoch index.
pub struct MerkleEngine {
    store: Arc<RecordStore>,
}

impl MerkleEngine {
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// Accumulator over every epoch-index entry of one bucket in `[lower, upper)`.
    pub fn bucket_hash(&self, partition: u32, bucket: u32, lower: i64, upper: i64) -> Result<BucketHash> {
        let entries = self.store.scan_bucket(partition, bucket, lower, upper)?;
        Ok(entries.iter().map(|(_, bytes)| bytes).collect())
    }

    pub fn build_partition_tree(&self, partition: u32, lower: i64, upper: i64) -> Result<MerkleTree> {
        let mut buckets = Vec::with_capacity(self.store.partition_buckets() as usize);
        for bucket in 0..self.store.partition_buckets() {
            buckets.push(self.bucket_hash(partition, bucket, lower, upper)?);
        }
        tracing::trace!(
            "Built tree for partition {} over [{}, {})",
            partition,
            lower,
            upper
        );
        Ok(MerkleTree::from_buckets(buckets))
    }

    /// Freshly built tree in wire form, as served to peers.
    pub fn epoch_tree(&self, partition: u32, lower: i64, upper: i64) -> Result<EpochTreeObject> {
        let tree = self.build_partition_tree(partition, lower, upper)?;
        Ok(tree_to_wire_object(&tree, partition, lower, upper))
    }

    /// Stores `object` under `epochtree_<partition>_<last epoch of its window>`.
    pub fn persist_tree(&self, object: &EpochTreeObject) -> Result<()> {
        let index = self
            .store
            .codec()
            .build_epoch_tree_index(object.partition, object.epoch())?;
        self.store
            .storage()
            .put(index.as_bytes(), &bincode::serialize(object)?)
    }

    pub fn load_tree(&self, partition: u32, epoch: i64) -> Result<EpochTreeObject> {
        let index = self.store.codec().build_epoch_tree_index(partition, epoch)?;
        let bytes = self.store.storage().get(index.as_bytes())?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Highest-epoch persisted tree of `partition` that is marked valid.
    pub fn last_valid_tree(&self, partition: u32) -> Result<Option<EpochTreeObject>> {
        let (start, end) = self.store.codec().epoch_tree_range(partition)?;
        let mut last_valid = None;
        for (key, bytes) in self.store.storage().iter(start.as_bytes(), end.as_bytes())? {
            let object: EpochTreeObject = bincode::deserialize(&bytes).map_err(|e| {
                ClusterError::Encoding(format!(
                    "corrupt tree object {}: {}",
                    String::from_utf8_lossy(&key),
                    e
                ))
            })?;
            if object.valid {
                last_valid = Some(object);
            }
        }
        Ok(last_valid)
    }

    /// Epoch of the last valid tree, or 0 when the partition was never verified.
    pub fn last_valid_epoch(&self, partition: u32) -> Result<i64> {
        Ok(self
            .last_valid_tree(partition)?
            .map(|object| object.epoch())
            .unwrap_or(0))
    }
}

pub fn tree_to_wire_object(
    tree: &MerkleTree,
    partition: u32,
    lower_epoch: i64,
    upper_epoch: i64,
) -> EpochTreeObject {
    EpochTreeObject {
        partition,
        lower_epoch,
        upper_epoch,
        buckets: tree.buckets().iter().map(BucketHash::value).collect(),
        valid: false,
    }
}

pub fn wire_object_to_tree(object: &EpochTreeObject) -> MerkleTree {
    MerkleTree::from_buckets(
        object
            .buckets
            .iter()
            .copied()
            .map(BucketHash::from_raw)
            .collect(),
    )
}
