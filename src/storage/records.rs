use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use super::engine::Storage;
use super::index::{EpochIndexCodec, EpochIndexKey, item_index};
use super::types::Record;
use crate::error::{ClusterError, Result};

/// Outcome of a write that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The exact same version was already stored.
    Unchanged,
}

/// Record-level view over the raw storage engine.
///
/// Every record lives under two keys: `item_<key>` holds the latest version, and the
/// epoch index key holds the version written in that epoch. The epoch index is what
/// range scans and Merkle trees read.
pub struct RecordStore {
    db: Arc<dyn Storage>,
    codec: EpochIndexCodec,
    partition_buckets: u32,
    /// Serializes read-compare-write so stale checks cannot interleave.
    write_lock: Mutex<()>,
}

impl RecordStore {
    pub fn new(db: Arc<dyn Storage>, codec: EpochIndexCodec, partition_buckets: u32) -> Self {
        Self {
            db,
            codec,
            partition_buckets,
            write_lock: Mutex::new(()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.db
    }

    pub fn codec(&self) -> &EpochIndexCodec {
        &self.codec
    }

    pub fn partition_buckets(&self) -> u32 {
        self.partition_buckets
    }

    /// Merkle bucket of a key: first 8 bytes of SHA-256, big-endian, modulo bucket count.
    pub fn bucket_for(&self, key: &str) -> u32 {
        let digest = Sha256::digest(key.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(head) % self.partition_buckets as u64) as u32
    }

    /// Stores `record` in `partition`.
    ///
    /// Rejects with `ClusterError::Stale` when the stored version is newer.
    pub fn set_value(&self, partition: u32, record: &Record) -> Result<WriteOutcome> {
        let item_key = item_index(&record.key);
        let bucket = self.bucket_for(&record.key);
        let epoch_key =
            self.codec
                .build_epoch_index(partition, bucket, record.epoch, &record.key)?;
        let encoded = record.encode()?;

        let _guard = self.write_lock.lock();

        match self.db.get(item_key.as_bytes()) {
            Ok(existing_bytes) => {
                let existing = Record::decode(&existing_bytes)?;
                if record.is_older_than(&existing) {
                    tracing::warn!(
                        "Rejected stale write for {} (epoch {} ts {} < epoch {} ts {})",
                        record.key,
                        record.epoch,
                        record.timestamp,
                        existing.epoch,
                        existing.timestamp
                    );
                    return Err(ClusterError::Stale(format!(
                        "a newer value already exists for {}",
                        record.key
                    )));
                }
                if existing == *record {
                    return Ok(WriteOutcome::Unchanged);
                }
            }
            Err(ClusterError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        self.db.write_batch(vec![
            (item_key.into_bytes(), encoded.clone()),
            (epoch_key.into_bytes(), encoded),
        ])?;

        Ok(WriteOutcome::Written)
    }

    /// Applies a record streamed from a replica during sync.
    ///
    /// The epoch index slot of `(key, record.epoch)` takes the streamed version unless it
    /// already holds a newer one, so both replicas index the same versions afterwards.
    /// `item_<key>` only moves forward. Never returns `Stale`.
    pub fn apply_synced(&self, partition: u32, record: &Record) -> Result<WriteOutcome> {
        let item_key = item_index(&record.key);
        let bucket = self.bucket_for(&record.key);
        let epoch_key =
            self.codec
                .build_epoch_index(partition, bucket, record.epoch, &record.key)?;
        let encoded = record.encode()?;

        let _guard = self.write_lock.lock();

        let mut batch = Vec::with_capacity(2);
        if self.is_newer_than_stored(epoch_key.as_bytes(), record)? {
            batch.push((epoch_key.into_bytes(), encoded.clone()));
        }
        if self.is_newer_than_stored(item_key.as_bytes(), record)? {
            batch.push((item_key.into_bytes(), encoded));
        } else {
            tracing::debug!(
                "Kept local item of {}, indexed streamed epoch {} only",
                record.key,
                record.epoch
            );
        }

        if batch.is_empty() {
            return Ok(WriteOutcome::Unchanged);
        }
        self.db.write_batch(batch)?;
        Ok(WriteOutcome::Written)
    }

    fn is_newer_than_stored(&self, key: &[u8], record: &Record) -> Result<bool> {
        match self.db.get(key) {
            Ok(bytes) => {
                let stored = Record::decode(&bytes)?;
                Ok(stored != *record && !record.is_older_than(&stored))
            }
            Err(ClusterError::NotFound(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }

    pub fn get_value(&self, key: &str) -> Result<Record> {
        let bytes = self.db.get(item_index(key).as_bytes())?;
        Ok(Record::decode(&bytes)?)
    }

    /// Raw epoch-index entries of one bucket for epochs `[lower, upper)`.
    pub fn scan_bucket(
        &self,
        partition: u32,
        bucket: u32,
        lower: i64,
        upper: i64,
    ) -> Result<Vec<(EpochIndexKey, Vec<u8>)>> {
        if upper <= lower {
            return Ok(Vec::new());
        }
        let (start, end) = self.codec.epoch_range(partition, bucket, lower, upper)?;
        let mut entries = Vec::new();
        for (key, value) in self.db.iter(start.as_bytes(), end.as_bytes())? {
            let raw = String::from_utf8(key)
                .map_err(|e| ClusterError::Encoding(format!("index key not utf-8: {}", e)))?;
            entries.push((self.codec.parse_epoch_index(&raw)?, value));
        }
        Ok(entries)
    }

    /// Records of the given buckets (all buckets when empty) for epochs `[lower, upper)`.
    pub fn stream_buckets(
        &self,
        partition: u32,
        buckets: &[u32],
        lower: i64,
        upper: i64,
    ) -> Result<Vec<Record>> {
        let all: Vec<u32>;
        let buckets = if buckets.is_empty() {
            all = (0..self.partition_buckets).collect();
            &all
        } else {
            buckets
        };

        let mut records = Vec::new();
        for &bucket in buckets {
            if bucket >= self.partition_buckets {
                return Err(ClusterError::Encoding(format!(
                    "bucket {} out of range (buckets: {})",
                    bucket, self.partition_buckets
                )));
            }
            for (_, bytes) in self.scan_bucket(partition, bucket, lower, upper)? {
                records.push(Record::decode(&bytes)?);
            }
        }
        Ok(records)
    }
}
