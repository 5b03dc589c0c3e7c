use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::RwLock;

use crate::error::{ClusterError, Result};

/// Finite, single-pass iterator over `(key, value)` pairs in key-byte order.
pub type KvIter = Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + Send>;

/// The storage collaborator: an ordered byte-keyed store.
///
/// Keys are opaque; callers build index keys themselves.
pub trait Storage: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Returns `ClusterError::NotFound` when the key is absent.
    fn get(&self, key: &[u8]) -> Result<Vec<u8>>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Iterates `[start, end)`. An empty `end` means unbounded.
    fn iter(&self, start: &[u8], end: &[u8]) -> Result<KvIter>;

    /// Applies all puts atomically with respect to readers.
    fn write_batch(&self, batch: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()>;
}

/// In-memory ordered storage.
///
/// Iterators work on a snapshot of the requested range, so writers never wait
/// on a slow consumer.
#[derive(Default)]
pub struct MemoryStorage {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.data
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(String::from_utf8_lossy(key).into_owned()))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.data.write().remove(key);
        Ok(())
    }

    fn iter(&self, start: &[u8], end: &[u8]) -> Result<KvIter> {
        let upper = if end.is_empty() {
            Bound::Unbounded
        } else {
            if end < start {
                return Err(ClusterError::Storage(
                    "iterator end key sorts before start key".into(),
                ));
            }
            Bound::Excluded(end.to_vec())
        };

        let snapshot: Vec<(Vec<u8>, Vec<u8>)> = self
            .data
            .read()
            .range((Bound::Included(start.to_vec()), upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Box::new(snapshot.into_iter()))
    }

    fn write_batch(&self, batch: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        let mut data = self.data.write();
        for (key, value) in batch {
            data.insert(key, value);
        }
        Ok(())
    }
}
