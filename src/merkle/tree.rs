use sha2::{Digest, Sha256};

use super::hash::BucketHash;
use crate::error::{ClusterError, Result};

pub type NodeHash = [u8; 32];

const LEAF_TAG: u8 = 0x00;
const INNER_TAG: u8 = 0x01;

/// Binary hash tree over the bucket accumulators of one partition.
///
/// `levels[0]` holds the leaves (one per bucket) and the last level holds the root.
/// A node without a sibling is paired with itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    buckets: Vec<BucketHash>,
    levels: Vec<Vec<NodeHash>>,
}

impl MerkleTree {
    pub fn from_buckets(buckets: Vec<BucketHash>) -> Self {
        let leaves: Vec<NodeHash> = buckets
            .iter()
            .enumerate()
            .map(|(i, hash)| leaf_hash(i as u32, *hash))
            .collect();

        let mut levels = vec![leaves];
        while let Some(last) = levels.last()
            && last.len() > 1
        {
            let next = last
                .chunks(2)
                .map(|pair| inner_hash(&pair[0], pair.get(1).unwrap_or(&pair[0])))
                .collect();
            levels.push(next);
        }

        Self { buckets, levels }
    }

    pub fn root(&self) -> NodeHash {
        match self.levels.last().and_then(|level| level.first()) {
            Some(root) => *root,
            None => Sha256::digest(b"").into(),
        }
    }

    pub fn buckets(&self) -> &[BucketHash] {
        &self.buckets
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Buckets whose hashes differ between `self` and `other`, in ascending order.
    ///
    /// Walks down from the root and only descends into subtrees whose hashes differ.
    pub fn diff_buckets(&self, other: &MerkleTree) -> Result<Vec<u32>> {
        if self.bucket_count() != other.bucket_count() {
            return Err(ClusterError::Invariant(format!(
                "cannot compare trees with {} and {} buckets",
                self.bucket_count(),
                other.bucket_count()
            )));
        }

        let mut diverged = Vec::new();
        if self.root() == other.root() || self.levels[0].is_empty() {
            return Ok(diverged);
        }

        let top = self.levels.len() - 1;
        let mut stack = vec![(top, 0usize)];
        while let Some((level, index)) = stack.pop() {
            if self.levels[level][index] == other.levels[level][index] {
                continue;
            }
            if level == 0 {
                diverged.push(index as u32);
                continue;
            }
            let below = &self.levels[level - 1];
            let left = index * 2;
            // Right first so the left subtree is visited first.
            if left + 1 < below.len() {
                stack.push((level - 1, left + 1));
            }
            stack.push((level - 1, left));
        }

        Ok(diverged)
    }
}

fn leaf_hash(bucket: u32, hash: BucketHash) -> NodeHash {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_TAG]);
    hasher.update(bucket.to_be_bytes());
    hasher.update(hash.value().to_be_bytes());
    hasher.finalize().into()
}

fn inner_hash(left: &NodeHash, right: &NodeHash) -> NodeHash {
    let mut hasher = Sha256::new();
    hasher.update([INNER_TAG]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}
