use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::locker::PartitionLocker;
use super::queue::WorkQueue;
use super::types::{
    ConsistencyState, ControllerStats, StatsSnapshot, SyncOutcome, VerifyOutcome, WorkItem,
    WorkKind,
};
use crate::config::ClusterConfig;
use crate::consensus::clock::EpochClock;
use crate::consensus::types::{ApplyState, EpochEvent};
use crate::error::{ClusterError, Result};
use crate::merkle::engine::{MerkleEngine, tree_to_wire_object, wire_object_to_tree};
use crate::ring::hashring::HashRing;
use crate::ring::types::PartitionsUpdate;
use crate::storage::records::WriteOutcome;
use crate::transport::client::{ClientManager, PeerClient};
use crate::transport::protocol::{EpochTreeRequest, StreamBucketsRequest};

const BUSY_RETRY_DELAY: Duration = Duration::from_millis(200);

pub struct ConsistencyController {
    local: String,
    ring: Arc<HashRing>,
    clock: Arc<EpochClock>,
    merkle: Arc<MerkleEngine>,
    clients: Arc<ClientManager>,
    active: Vec<AtomicBool>,
    queue: WorkQueue,
    locker: PartitionLocker,
    stats: ControllerStats,
    rpc_timeout: Duration,
    workers: usize,
}

impl ConsistencyController {
    pub fn new(
        config: &ClusterConfig,
        ring: Arc<HashRing>,
        clock: Arc<EpochClock>,
        merkle: Arc<MerkleEngine>,
        clients: Arc<ClientManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local: config.node_name.clone(),
            ring,
            clock,
            merkle,
            clients,
            active: (0..config.partition_count)
                .map(|_| AtomicBool::new(false))
                .collect(),
            queue: WorkQueue::new(),
            locker: PartitionLocker::new(config.partition_count),
            stats: ControllerStats::default(),
            rpc_timeout: config.default_timeout,
            workers: config.workers,
        })
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn locker(&self) -> &PartitionLocker {
        &self.locker
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_active(&self, partition: u32) -> bool {
        self.active
            .get(partition as usize)
            .map(|flag| flag.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn state(&self, partition: u32) -> ConsistencyState {
        ConsistencyState {
            partition,
            active: self.is_active(partition),
            syncing: self.locker.is_locked(partition),
        }
    }

    pub fn active_partitions(&self) -> Vec<u32> {
        (0..self.active.len() as u32)
            .filter(|&p| self.is_active(p))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.active
            .iter()
            .filter(|flag| flag.load(Ordering::Acquire))
            .count()
    }

    // ============================================================
    // EVENTS
    // ============================================================

    /// Activates newly owned partitions with a Sync and deactivates lost ones.
    pub fn handle_partitions_update(&self, update: &PartitionsUpdate) {
        let epoch = self.clock.current_epoch();
        let mut gained = 0;
        let mut lost = 0;

        for (partition, flag) in self.active.iter().enumerate() {
            let partition = partition as u32;
            let owned = update.owned.contains(&partition);
            let was_active = flag.swap(owned, Ordering::AcqRel);

            if owned && !was_active {
                gained += 1;
                self.queue.push(WorkItem::sync(partition, epoch));
            } else if !owned && was_active {
                lost += 1;
                tracing::warn!("Partition {} no longer owned, deactivating", partition);
            }
        }

        tracing::info!(
            "Ownership update on {}: {} members, {} owned (+{} / -{})",
            self.local,
            update.members.len(),
            update.owned.len(),
            gained,
            lost
        );
    }

    /// A valid epoch E schedules a Verify of E-1. A node that fell behind resyncs instead.
    pub fn handle_epoch(&self, event: EpochEvent) {
        let active = self.active_partitions();
        match event.state {
            ApplyState::Behind => {
                tracing::warn!(
                    "Epoch {} applied out of order, resyncing {} partitions",
                    event.epoch,
                    active.len()
                );
                for partition in active {
                    self.queue.push(WorkItem::sync(partition, event.epoch));
                }
            }
            ApplyState::Valid => {
                let verify_epoch = event.epoch - 1;
                if verify_epoch < 0 {
                    return;
                }
                tracing::debug!(
                    "Epoch {}: verifying epoch {} of {} partitions",
                    event.epoch,
                    verify_epoch,
                    active.len()
                );
                for partition in active {
                    self.queue.push(WorkItem::verify(partition, verify_epoch));
                }
            }
            ApplyState::Uninitialized => {}
        }
    }

    // ============================================================
    // TASKS
    // ============================================================

    /// Starts the event task and the worker pool.
    pub fn spawn(
        self: &Arc<Self>,
        partitions: mpsc::Receiver<PartitionsUpdate>,
        epochs: mpsc::UnboundedReceiver<EpochEvent>,
        shutdown: &broadcast::Sender<()>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.workers + 1);
        handles.push(tokio::spawn(Arc::clone(self).run_events(
            partitions,
            epochs,
            shutdown.subscribe(),
        )));
        for id in 0..self.workers {
            handles.push(tokio::spawn(
                Arc::clone(self).run_worker(id, shutdown.subscribe()),
            ));
        }
        handles
    }

    async fn run_events(
        self: Arc<Self>,
        mut partitions: mpsc::Receiver<PartitionsUpdate>,
        mut epochs: mpsc::UnboundedReceiver<EpochEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                Some(update) = partitions.recv() => self.handle_partitions_update(&update),
                Some(event) = epochs.recv() => self.handle_epoch(event),
                _ = shutdown.recv() => break,
                else => break,
            }
        }
        self.queue.close();
        tracing::info!("Consistency controller on {} stopped", self.local);
    }

    async fn run_worker(self: Arc<Self>, id: usize, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let item = tokio::select! {
                item = self.queue.pop() => item,
                _ = shutdown.recv() => None,
            };
            let Some(item) = item else {
                break;
            };
            self.process(item).await;
        }
        tracing::debug!("Consistency worker {} stopped", id);
    }

    /// Runs one work item under its partition lock.
    pub async fn process(self: &Arc<Self>, item: WorkItem) {
        if !self.is_active(item.partition) {
            tracing::debug!(
                "Skipping {:?} of inactive partition {}",
                item.kind,
                item.partition
            );
            self.queue.complete(&item);
            return;
        }

        let guard = match self.locker.acquire(item.partition) {
            Ok(guard) => guard,
            Err(ClusterError::Busy(partition)) => {
                tracing::debug!("Partition {} busy, retrying {:?} later", partition, item.kind);
                ControllerStats::incr(&self.stats.busy_retries);
                self.retry_later(item);
                return;
            }
            Err(e) => {
                tracing::error!("Cannot lock partition {}: {}", item.partition, e);
                self.queue.complete(&item);
                return;
            }
        };

        match item.kind {
            WorkKind::Sync => match self.sync_partition(item.partition, item.epoch).await {
                Ok(outcome) => {
                    ControllerStats::incr(&self.stats.syncs_completed);
                    if outcome.records_applied > 0 {
                        tracing::info!(
                            "Synced partition {} over [{}, {}): {} records from {} peers",
                            item.partition,
                            outcome.lower_epoch,
                            outcome.upper_epoch,
                            outcome.records_applied,
                            outcome.peers_responded
                        );
                    }
                }
                Err(e) => {
                    ControllerStats::incr(&self.stats.syncs_failed);
                    tracing::warn!("Sync of partition {} failed: {}", item.partition, e);
                }
            },
            WorkKind::Verify => match self.verify_partition(item.partition, item.epoch).await {
                Ok(outcome) => {
                    ControllerStats::incr(&self.stats.verifies_completed);
                    if outcome.mismatched > 0 {
                        ControllerStats::incr(&self.stats.verify_mismatches);
                        tracing::warn!(
                            "Partition {} diverged from {} replicas in epoch {}, scheduling sync",
                            item.partition,
                            outcome.mismatched,
                            outcome.epoch
                        );
                        self.queue
                            .push(WorkItem::sync(item.partition, self.clock.current_epoch()));
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Verify of partition {} at epoch {} failed: {}",
                        item.partition,
                        item.epoch,
                        e
                    );
                }
            },
        }

        drop(guard);
        self.queue.complete(&item);
    }

    fn retry_later(self: &Arc<Self>, item: WorkItem) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(BUSY_RETRY_DELAY * (item.attempts + 1)).await;
            if !controller.queue.requeue(item) {
                ControllerStats::incr(&controller.stats.items_dropped);
            }
        });
    }

    // ============================================================
    // SYNC / VERIFY
    // ============================================================

    /// Pulls every record the replicas hold for `[last valid epoch, epoch]` that differs
    /// locally, then marks the closed epochs of that window as valid once the local tree
    /// matches at least one replica.
    ///
    /// Fails only when no replica could be reached. A record that cannot be applied is
    /// logged and skipped.
    pub async fn sync_partition(&self, partition: u32, epoch: i64) -> Result<SyncOutcome> {
        let lower = self.merkle.last_valid_epoch(partition)?;
        let upper = epoch + 1;
        let mut outcome = SyncOutcome {
            lower_epoch: lower,
            upper_epoch: upper,
            ..Default::default()
        };

        let peers = self.ring.partition_owners(partition, false)?;
        if !peers.is_empty() {
            let ranked = self.rank_peers(partition, &peers).await;
            let mut local = self.merkle.build_partition_tree(partition, lower, upper)?;

            for client in ranked {
                let request = EpochTreeRequest {
                    partition,
                    lower_epoch: lower,
                    upper_epoch: upper,
                };
                let remote = match self.with_timeout(client.epoch_tree(request)).await {
                    Ok(remote) => remote,
                    Err(e) => {
                        tracing::warn!("Peer {} skipped during sync: {}", client.member(), e);
                        continue;
                    }
                };
                outcome.peers_responded += 1;

                let remote_tree = wire_object_to_tree(&remote);
                let diff = match local.diff_buckets(&remote_tree) {
                    Ok(diff) => diff,
                    Err(e) => {
                        tracing::warn!("Tree of {} not comparable: {}", client.member(), e);
                        continue;
                    }
                };
                if diff.is_empty() {
                    outcome.peers_matched += 1;
                    continue;
                }

                let request = StreamBucketsRequest {
                    partition,
                    buckets: diff.clone(),
                    lower_epoch: lower,
                    upper_epoch: upper,
                };
                let records = match self.with_timeout(client.stream_buckets(request)).await {
                    Ok(records) => records,
                    Err(e) => {
                        tracing::warn!("Streaming from {} failed: {}", client.member(), e);
                        continue;
                    }
                };

                let store = self.merkle.store();
                for record in records {
                    match store.apply_synced(partition, &record) {
                        Ok(WriteOutcome::Written) => outcome.records_applied += 1,
                        Ok(WriteOutcome::Unchanged) => {}
                        Err(e) => {
                            outcome.records_failed += 1;
                            tracing::warn!(
                                "Skipping {} from {} during sync of partition {}: {}",
                                record.key,
                                client.member(),
                                partition,
                                e
                            );
                        }
                    }
                }
                outcome.buckets_repaired += diff.len();
                local = self.merkle.build_partition_tree(partition, lower, upper)?;
                if local.root() == remote_tree.root() {
                    outcome.peers_matched += 1;
                }
            }

            if outcome.peers_responded == 0 {
                return Err(ClusterError::unreachable(
                    format!("replicas of partition {}", partition),
                    "no replica answered",
                ));
            }
        }

        self.stats
            .records_repaired
            .fetch_add(outcome.records_applied as u64, Ordering::Relaxed);
        self.stats
            .records_failed
            .fetch_add(outcome.records_failed as u64, Ordering::Relaxed);

        if !peers.is_empty() && outcome.peers_matched == 0 {
            tracing::warn!(
                "Partition {} still differs from every replica over [{}, {}), not marking it valid",
                partition,
                lower,
                upper
            );
            return Ok(outcome);
        }

        // The current epoch is still open; only the closed ones become the new marker.
        if epoch > lower {
            let closed = self.merkle.build_partition_tree(partition, lower, epoch)?;
            let mut marker = tree_to_wire_object(&closed, partition, lower, epoch);
            marker.valid = true;
            self.merkle.persist_tree(&marker)?;
        }

        Ok(outcome)
    }

    /// Compares the local tree of a single closed epoch with every replica.
    ///
    /// Does not stream. The tree is persisted, valid only when every replica agreed.
    pub async fn verify_partition(&self, partition: u32, epoch: i64) -> Result<VerifyOutcome> {
        let mut outcome = VerifyOutcome {
            epoch,
            ..Default::default()
        };

        let existing = match self.merkle.load_tree(partition, epoch) {
            Ok(existing) => Some(existing),
            Err(ClusterError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        if let Some(existing) = &existing
            && existing.valid
            && existing.lower_epoch == epoch
        {
            outcome.valid = true;
            return Ok(outcome);
        }

        let tree = self.merkle.build_partition_tree(partition, epoch, epoch + 1)?;
        let peers = self.ring.partition_owners(partition, false)?;

        for peer in &peers {
            let client = match self.clients.get(peer) {
                Ok(client) => client,
                Err(e) => {
                    tracing::warn!("Peer {} skipped during verify: {}", peer, e);
                    outcome.unreachable += 1;
                    continue;
                }
            };
            let request = EpochTreeRequest {
                partition,
                lower_epoch: epoch,
                upper_epoch: epoch + 1,
            };
            match self.with_timeout(client.epoch_tree(request)).await {
                Ok(remote) => {
                    if wire_object_to_tree(&remote).root() == tree.root() {
                        outcome.matched += 1;
                    } else {
                        outcome.mismatched += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!("Peer {} skipped during verify: {}", peer, e);
                    outcome.unreachable += 1;
                }
            }
        }

        if !peers.is_empty() && outcome.matched + outcome.mismatched == 0 {
            return Err(ClusterError::unreachable(
                format!("replicas of partition {}", partition),
                "no replica answered",
            ));
        }

        outcome.valid = outcome.mismatched == 0 && outcome.unreachable == 0;
        if !outcome.valid && existing.as_ref().is_some_and(|object| object.valid) {
            // A sync marker filed under this epoch stays the partition's last valid point.
            tracing::debug!(
                "Keeping valid marker of partition {} at epoch {}",
                partition,
                epoch
            );
            return Ok(outcome);
        }
        let mut object = tree_to_wire_object(&tree, partition, epoch, epoch + 1);
        object.valid = outcome.valid;
        self.merkle.persist_tree(&object)?;

        Ok(outcome)
    }

    /// Reachable replicas, most recently verified first.
    async fn rank_peers(&self, partition: u32, peers: &[String]) -> Vec<Arc<dyn PeerClient>> {
        let mut ranked = Vec::with_capacity(peers.len());
        for peer in peers {
            let client = match self.clients.get(peer) {
                Ok(client) => client,
                Err(e) => {
                    tracing::warn!("Peer {} skipped during sync: {}", peer, e);
                    continue;
                }
            };
            match self.with_timeout(client.epoch_tree_last_valid(partition)).await {
                Ok(tree) => {
                    let epoch = tree.map(|t| t.epoch()).unwrap_or(-1);
                    ranked.push((epoch, client));
                }
                Err(e) => tracing::warn!("Peer {} skipped during sync: {}", peer, e),
            }
        }
        ranked.sort_by(|a, b| b.0.cmp(&a.0));
        ranked.into_iter().map(|(_, client)| client).collect()
    }

    async fn with_timeout<T>(
        &self,
        call: impl std::future::Future<Output = anyhow::Result<T>>,
    ) -> anyhow::Result<T> {
        match tokio::time::timeout(self.rpc_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ClusterError::Timeout(format!("peer call exceeded {:?}", self.rpc_timeout)).into()),
        }
    }
}
