use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Sync sorts before Verify, whatever their epochs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WorkKind {
    Sync,
    Verify,
}

/// Identity used to de-duplicate queued work.
pub type WorkKey = (WorkKind, u32, i64);

#[derive(Debug, Clone)]
pub struct WorkItem {
    pub epoch: i64,
    pub partition: u32,
    pub kind: WorkKind,
    /// Times this item was put back because its partition was busy.
    pub attempts: u32,
    /// Shared with every copy of the item; set once it has been handled or dropped.
    pub completed: Arc<AtomicBool>,
}

impl WorkItem {
    pub fn new(kind: WorkKind, partition: u32, epoch: i64) -> Self {
        Self {
            epoch,
            partition,
            kind,
            attempts: 0,
            completed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn sync(partition: u32, epoch: i64) -> Self {
        Self::new(WorkKind::Sync, partition, epoch)
    }

    pub fn verify(partition: u32, epoch: i64) -> Self {
        Self::new(WorkKind::Verify, partition, epoch)
    }

    pub fn key(&self) -> WorkKey {
        (self.kind, self.partition, self.epoch)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionStatus {
    Inactive,
    InSync,
    Syncing,
}

/// Point-in-time view of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyState {
    pub partition: u32,
    pub active: bool,
    pub syncing: bool,
}

impl ConsistencyState {
    pub fn status(&self) -> PartitionStatus {
        match (self.active, self.syncing) {
            (false, _) => PartitionStatus::Inactive,
            (true, false) => PartitionStatus::InSync,
            (true, true) => PartitionStatus::Syncing,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub lower_epoch: i64,
    pub upper_epoch: i64,
    pub peers_responded: usize,
    /// Replicas whose tree equals the local one once repairs were applied.
    pub peers_matched: usize,
    pub buckets_repaired: usize,
    pub records_applied: usize,
    pub records_failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyOutcome {
    pub epoch: i64,
    pub matched: usize,
    pub mismatched: usize,
    pub unreachable: usize,
    pub valid: bool,
}

#[derive(Debug, Default)]
pub struct ControllerStats {
    pub syncs_completed: AtomicU64,
    pub syncs_failed: AtomicU64,
    pub verifies_completed: AtomicU64,
    pub verify_mismatches: AtomicU64,
    pub records_repaired: AtomicU64,
    pub records_failed: AtomicU64,
    pub busy_retries: AtomicU64,
    pub items_dropped: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub syncs_completed: u64,
    pub syncs_failed: u64,
    pub verifies_completed: u64,
    pub verify_mismatches: u64,
    pub records_repaired: u64,
    pub records_failed: u64,
    pub busy_retries: u64,
    pub items_dropped: u64,
}

impl ControllerStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            syncs_completed: self.syncs_completed.load(Ordering::Relaxed),
            syncs_failed: self.syncs_failed.load(Ordering::Relaxed),
            verifies_completed: self.verifies_completed.load(Ordering::Relaxed),
            verify_mismatches: self.verify_mismatches.load(Ordering::Relaxed),
            records_repaired: self.records_repaired.load(Ordering::Relaxed),
            records_failed: self.records_failed.load(Ordering::Relaxed),
            busy_retries: self.busy_retries.load(Ordering::Relaxed),
            items_dropped: self.items_dropped.load(Ordering::Relaxed),
        }
    }
}
