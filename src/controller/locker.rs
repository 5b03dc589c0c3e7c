use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{ClusterError, Result};

/// Non-blocking per-partition mutual exclusion.
///
/// `lock` never waits: it either takes the flag or fails with `ClusterError::Busy`.
pub struct PartitionLocker {
    locks: Vec<AtomicBool>,
}

impl PartitionLocker {
    pub fn new(partition_count: u32) -> Self {
        Self {
            locks: (0..partition_count).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    fn slot(&self, partition: u32) -> Result<&AtomicBool> {
        self.locks.get(partition as usize).ok_or_else(|| {
            ClusterError::Invariant(format!(
                "partition {} outside [0, {})",
                partition,
                self.locks.len()
            ))
        })
    }

    pub fn lock(&self, partition: u32) -> Result<()> {
        self.slot(partition)?
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| ClusterError::Busy(partition))
    }

    pub fn unlock(&self, partition: u32) -> Result<()> {
        self.slot(partition)?.store(false, Ordering::Release);
        Ok(())
    }

    pub fn is_locked(&self, partition: u32) -> bool {
        self.slot(partition)
            .map(|slot| slot.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Like `lock`, releasing the partition when the guard drops.
    pub fn acquire(&self, partition: u32) -> Result<PartitionGuard<'_>> {
        self.lock(partition)?;
        Ok(PartitionGuard {
            locker: self,
            partition,
        })
    }
}

pub struct PartitionGuard<'a> {
    locker: &'a PartitionLocker,
    partition: u32,
}

impl Drop for PartitionGuard<'_> {
    fn drop(&mut self) {
        // The slot was validated when the guard was created.
        let _ = self.locker.unlock(self.partition);
    }
}
