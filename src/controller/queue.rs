use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::types::{WorkItem, WorkKey, WorkKind};

/// Items are dropped once they have been put back this many times.
pub const MAX_ATTEMPTS: u32 = 3;

type Priority = (u32, WorkKind, i64, u64);

struct Queued {
    priority: Reverse<Priority>,
    item: WorkItem,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority)
    }
}

/// Shared min-priority queue of Sync / Verify work.
///
/// Ordering is `(attempts, kind, epoch, insertion order)`, so fresh work runs before
/// retried work, every pending Sync runs before any Verify, and older epochs run before
/// newer ones of the same kind. An item stays registered from
/// `push` until `complete`, and pushing an equal `(kind, partition, epoch)` in that
/// window is a no-op.
pub struct WorkQueue {
    heap: Mutex<BinaryHeap<Queued>>,
    in_flight: DashMap<WorkKey, ()>,
    notify: Notify,
    seq: AtomicU64,
    closed: AtomicBool,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            in_flight: DashMap::new(),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::Acquire)
    }

    /// Returns false when an equal item is already queued or running.
    pub fn push(&self, item: WorkItem) -> bool {
        if self.is_closed() {
            return false;
        }
        if self.in_flight.insert(item.key(), ()).is_some() {
            tracing::trace!(
                "Skipping duplicate {:?} for partition {} epoch {}",
                item.kind,
                item.partition,
                item.epoch
            );
            return false;
        }
        self.enqueue(item);
        true
    }

    fn enqueue(&self, item: WorkItem) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        let priority = Reverse((item.attempts, item.kind, item.epoch, seq));
        self.heap.lock().push(Queued { priority, item });
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<WorkItem> {
        self.heap.lock().pop().map(|queued| queued.item)
    }

    /// Waits for the next item. Returns `None` once the queue is closed.
    pub async fn pop(&self) -> Option<WorkItem> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the await is not lost.
            notified.as_mut().enable();

            if self.is_closed() {
                return None;
            }
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            notified.await;
        }
    }

    /// Puts a running item back with one more attempt.
    ///
    /// Returns false and completes the item when it ran out of attempts.
    pub fn requeue(&self, mut item: WorkItem) -> bool {
        item.attempts += 1;
        if item.attempts >= MAX_ATTEMPTS || self.is_closed() {
            tracing::warn!(
                "Dropping {:?} for partition {} epoch {} after {} attempts",
                item.kind,
                item.partition,
                item.epoch,
                item.attempts
            );
            self.complete(&item);
            return false;
        }
        self.enqueue(item);
        true
    }

    pub fn complete(&self, item: &WorkItem) {
        item.mark_completed();
        self.in_flight.remove(&item.key());
    }

    /// Wakes every waiting `pop` and rejects further pushes.
    pub fn close(&self) {
        self.closed.store(true, AtomicOrdering::Release);
        self.notify.notify_waiters();
    }
}
