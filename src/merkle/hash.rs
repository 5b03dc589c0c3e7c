use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

/// Additive accumulator over a multiset of byte strings.
///
/// Each element contributes `xxh3_64(bytes)`; contributions are summed modulo 2^64,
/// so the result is independent of insertion order and `remove` undoes `add`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketHash(u64);

impl BucketHash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn add(&mut self, bytes: &[u8]) {
        self.0 = self.0.wrapping_add(xxh3_64(bytes));
    }

    pub fn remove(&mut self, bytes: &[u8]) {
        self.0 = self.0.wrapping_sub(xxh3_64(bytes));
    }

    /// Folds another accumulator into this one (multiset union).
    pub fn merge(&mut self, other: BucketHash) {
        self.0 = self.0.wrapping_add(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl<B: AsRef<[u8]>> FromIterator<B> for BucketHash {
    fn from_iter<I: IntoIterator<Item = B>>(iter: I) -> Self {
        let mut hash = BucketHash::new();
        for bytes in iter {
            hash.add(bytes.as_ref());
        }
        hash
    }
}
