//! Consistency Controller Tests
//!
//! ## Test Scopes
//! - **Queue**: priority order, de-duplication, retry limits and wake-ups.
//! - **Locker**: non-blocking exclusion per partition.
//! - **Controller**: ownership and epoch events, and Sync / Verify against an
//!   in-process replica whose storage is manipulated directly.

#[cfg(test)]
mod tests {
    use crate::config::ClusterConfig;
    use crate::consensus::clock::EpochClock;
    use crate::consensus::fsm::{EpochFsm, StateMachine};
    use crate::consensus::log::LocalLog;
    use crate::consensus::types::{ApplyState, EpochCommand, EpochEvent, LogEntry};
    use crate::controller::controller::ConsistencyController;
    use crate::controller::locker::PartitionLocker;
    use crate::controller::queue::{MAX_ATTEMPTS, WorkQueue};
    use crate::controller::types::{PartitionStatus, WorkItem, WorkKind};
    use crate::error::ClusterError;
    use crate::membership::types::MemberInfo;
    use crate::merkle::engine::MerkleEngine;
    use crate::merkle::types::EpochTreeObject;
    use crate::ring::hashring::HashRing;
    use crate::ring::types::PartitionsUpdate;
    use crate::storage::engine::MemoryStorage;
    use crate::storage::index::EpochIndexCodec;
    use crate::storage::records::RecordStore;
    use crate::storage::types::Record;
    use crate::transport::client::{ClientManager, PeerClient, PeerConnector};
    use crate::transport::protocol::{
        AppendEpochRequest, EpochTreeRequest, HealthResponse, StreamBucketsRequest,
    };
    use async_trait::async_trait;
    use dashmap::DashMap;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const PARTITIONS: u32 = 16;
    const BUCKETS: u32 = 8;

    // ============================================================
    // HELPERS
    // ============================================================

    fn merkle_engine() -> Arc<MerkleEngine> {
        let store = RecordStore::new(
            Arc::new(MemoryStorage::new()),
            EpochIndexCodec::default(),
            BUCKETS,
        );
        Arc::new(MerkleEngine::new(Arc::new(store)))
    }

    fn record(key: &str, value: &str, epoch: i64) -> Record {
        Record {
            key: key.to_string(),
            value: value.as_bytes().to_vec(),
            epoch,
            timestamp: epoch * 100,
        }
    }

    /// A replica answering straight from its own Merkle engine.
    struct EnginePeer {
        name: String,
        merkle: Arc<MerkleEngine>,
        /// Streamed ahead of the replica's own records.
        injected: Vec<Record>,
    }

    #[async_trait]
    impl PeerClient for EnginePeer {
        fn member(&self) -> &str {
            &self.name
        }

        async fn set_value(&self, partition: u32, record: &Record) -> anyhow::Result<bool> {
            let outcome = self.merkle.store().set_value(partition, record)?;
            Ok(outcome == crate::storage::records::WriteOutcome::Written)
        }

        async fn get_value(&self, key: &str) -> anyhow::Result<Option<Record>> {
            Ok(self.merkle.store().get_value(key).ok())
        }

        async fn stream_buckets(&self, r: StreamBucketsRequest) -> anyhow::Result<Vec<Record>> {
            let mut records = self.injected.clone();
            records.extend(self.merkle.store().stream_buckets(
                r.partition,
                &r.buckets,
                r.lower_epoch,
                r.upper_epoch,
            )?);
            Ok(records)
        }

        async fn epoch_tree(&self, r: EpochTreeRequest) -> anyhow::Result<EpochTreeObject> {
            Ok(self
                .merkle
                .epoch_tree(r.partition, r.lower_epoch, r.upper_epoch)?)
        }

        async fn epoch_tree_last_valid(
            &self,
            partition: u32,
        ) -> anyhow::Result<Option<EpochTreeObject>> {
            Ok(self.merkle.last_valid_tree(partition)?)
        }

        async fn append_epoch(&self, _request: AppendEpochRequest) -> anyhow::Result<()> {
            Ok(())
        }

        async fn health(&self) -> anyhow::Result<HealthResponse> {
            anyhow::bail!("not served by test replicas")
        }
    }

    #[derive(Default)]
    struct EngineConnector {
        peers: DashMap<String, Arc<MerkleEngine>>,
        injected: DashMap<String, Vec<Record>>,
    }

    impl PeerConnector for EngineConnector {
        fn connect(&self, member: &MemberInfo) -> anyhow::Result<Arc<dyn PeerClient>> {
            let merkle = self
                .peers
                .get(&member.name)
                .map(|entry| Arc::clone(entry.value()))
                .ok_or_else(|| anyhow::anyhow!("no replica named {}", member.name))?;
            let injected = self
                .injected
                .get(&member.name)
                .map(|entry| entry.value().clone())
                .unwrap_or_default();
            Ok(Arc::new(EnginePeer {
                name: member.name.clone(),
                merkle,
                injected,
            }))
        }
    }

    struct Harness {
        controller: Arc<ConsistencyController>,
        ring: Arc<HashRing>,
        fsm: Arc<EpochFsm>,
        merkle: Arc<MerkleEngine>,
        clients: Arc<ClientManager>,
        connector: Arc<EngineConnector>,
        update: PartitionsUpdate,
        _updates: mpsc::Receiver<PartitionsUpdate>,
        _events: mpsc::UnboundedReceiver<EpochEvent>,
    }

    impl Harness {
        fn advance_to(&self, epoch: i64) {
            let entry = LogEntry {
                index: self.fsm.last_index() + 1,
                term: 1,
                data: EpochCommand { epoch }.encode().unwrap(),
            };
            self.fsm.apply(&entry).unwrap();
        }
    }

    /// Controller "a" sharing every partition with the replicas in `peers`.
    async fn harness(peers: &[(&str, Arc<MerkleEngine>)]) -> Harness {
        let config = ClusterConfig::new("a")
            .with_partition_count(PARTITIONS)
            .with_partition_buckets(BUCKETS)
            .with_replica_count(peers.len() + 1)
            .with_default_timeout(Duration::from_millis(500));

        let (updates_tx, updates_rx) = mpsc::channel(16);
        let ring = HashRing::new(&config, updates_tx);
        ring.add_member("a");

        let connector = Arc::new(EngineConnector::default());
        let clients = Arc::new(ClientManager::new(connector.clone()));
        let addr = "127.0.0.1:0".parse().unwrap();
        for (name, merkle) in peers {
            connector.peers.insert(name.to_string(), Arc::clone(merkle));
            ring.add_member(name);
            clients.add_member(&MemberInfo::new(*name, addr, addr)).unwrap();
        }
        let update = ring.recompute().await.unwrap();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let fsm = Arc::new(EpochFsm::new(events_tx));
        let log = Arc::new(LocalLog::new("a", fsm.clone(), None, config.default_timeout));
        let clock = Arc::new(EpochClock::new(&config, log, fsm.clone()));
        let merkle = merkle_engine();

        let controller = ConsistencyController::new(
            &config,
            ring.clone(),
            clock,
            merkle.clone(),
            clients.clone(),
        );

        Harness {
            controller,
            ring,
            fsm,
            merkle,
            clients,
            connector,
            update,
            _updates: updates_rx,
            _events: events_rx,
        }
    }

    fn owned(partitions: &[u32]) -> PartitionsUpdate {
        PartitionsUpdate {
            members: vec!["a".to_string()],
            owned: partitions.iter().copied().collect::<BTreeSet<u32>>(),
        }
    }

    // ============================================================
    // QUEUE TESTS
    // ============================================================

    #[test]
    fn test_queue_orders_sync_before_verify_then_by_epoch() {
        let queue = WorkQueue::new();
        queue.push(WorkItem::verify(0, 2));
        queue.push(WorkItem::verify(1, 1));
        queue.push(WorkItem::sync(2, 1));

        let order: Vec<(WorkKind, i64)> = std::iter::from_fn(|| queue.try_pop())
            .map(|item| (item.kind, item.epoch))
            .collect();

        assert_eq!(
            order,
            vec![
                (WorkKind::Sync, 1),
                (WorkKind::Verify, 1),
                (WorkKind::Verify, 2)
            ]
        );
    }

    #[test]
    fn test_queue_runs_later_sync_before_earlier_verify() {
        let queue = WorkQueue::new();
        queue.push(WorkItem::verify(1, 1));
        queue.push(WorkItem::sync(2, 5));
        queue.push(WorkItem::sync(3, 3));

        let order: Vec<(WorkKind, u32, i64)> = std::iter::from_fn(|| queue.try_pop())
            .map(|item| item.key())
            .collect();

        assert_eq!(
            order,
            vec![
                (WorkKind::Sync, 3, 3),
                (WorkKind::Sync, 2, 5),
                (WorkKind::Verify, 1, 1)
            ]
        );
    }

    #[test]
    fn test_queue_runs_fresh_items_before_retries() {
        let queue = WorkQueue::new();
        queue.push(WorkItem::sync(0, 1));
        let retried = queue.try_pop().unwrap();
        assert!(queue.requeue(retried));

        queue.push(WorkItem::verify(1, 9));

        assert_eq!(queue.try_pop().unwrap().partition, 1);
        let second = queue.try_pop().unwrap();
        assert_eq!(second.partition, 0);
        assert_eq!(second.attempts, 1);
    }

    #[test]
    fn test_queue_dedupes_until_completed() {
        let queue = WorkQueue::new();
        assert!(queue.push(WorkItem::sync(3, 1)));
        assert!(!queue.push(WorkItem::sync(3, 1)));
        // same partition, different kind or epoch, is distinct work
        assert!(queue.push(WorkItem::verify(3, 1)));
        assert!(queue.push(WorkItem::sync(3, 2)));

        let item = queue.try_pop().unwrap();
        assert_eq!(item.key(), (WorkKind::Sync, 3, 1));
        assert!(!queue.push(WorkItem::sync(3, 1)), "still running");

        queue.complete(&item);
        assert!(item.is_completed());
        assert!(queue.push(WorkItem::sync(3, 1)));
    }

    #[test]
    fn test_queue_drops_item_after_max_attempts() {
        let queue = WorkQueue::new();
        queue.push(WorkItem::sync(0, 1));

        let mut requeued = 0;
        while let Some(item) = queue.try_pop() {
            if queue.requeue(item.clone()) {
                requeued += 1;
            } else {
                assert_eq!(item.attempts + 1, MAX_ATTEMPTS);
                assert!(item.is_completed());
            }
        }

        assert_eq!(requeued, MAX_ATTEMPTS as usize - 1);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;

        queue.push(WorkItem::verify(5, 4));

        let item = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(item.key(), (WorkKind::Verify, 5, 4));
    }

    #[tokio::test]
    async fn test_pop_returns_none_after_close() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;

        queue.close();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_none());
        assert!(!queue.push(WorkItem::sync(0, 1)));
    }

    // ============================================================
    // LOCKER TESTS
    // ============================================================

    #[test]
    fn test_lock_is_exclusive_until_unlocked() {
        let locker = PartitionLocker::new(4);

        assert!(locker.lock(2).is_ok());
        assert!(matches!(locker.lock(2), Err(ClusterError::Busy(2))));
        assert!(locker.lock(3).is_ok(), "other partitions are independent");

        locker.unlock(2).unwrap();
        assert!(locker.lock(2).is_ok());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let locker = PartitionLocker::new(4);
        {
            let _guard = locker.acquire(1).unwrap();
            assert!(locker.is_locked(1));
            assert!(locker.acquire(1).is_err());
        }
        assert!(!locker.is_locked(1));
    }

    #[test]
    fn test_lock_out_of_range_is_invariant() {
        let locker = PartitionLocker::new(4);
        assert!(matches!(locker.lock(4), Err(ClusterError::Invariant(_))));
    }

    // ============================================================
    // EVENT TESTS
    // ============================================================

    #[tokio::test]
    async fn test_ownership_changes_drive_state() {
        let h = harness(&[]).await;

        // ACT: gain 1 and 3
        h.controller.handle_partitions_update(&owned(&[1, 3]));

        // ASSERT
        assert_eq!(h.controller.active_partitions(), vec![1, 3]);
        assert_eq!(h.controller.state(1).status(), PartitionStatus::InSync);
        assert_eq!(h.controller.state(0).status(), PartitionStatus::Inactive);
        assert_eq!(h.controller.queue().len(), 2);

        // ACT: lose 1, keep 3, gain 4
        h.controller.handle_partitions_update(&owned(&[3, 4]));

        // ASSERT: only partition 4 is newly scheduled
        assert_eq!(h.controller.active_partitions(), vec![3, 4]);
        assert_eq!(h.controller.queue().len(), 3);
    }

    #[tokio::test]
    async fn test_locked_partition_reports_syncing() {
        let h = harness(&[]).await;
        h.controller.handle_partitions_update(&owned(&[2]));

        h.controller.locker().lock(2).unwrap();

        assert_eq!(h.controller.state(2).status(), PartitionStatus::Syncing);
    }

    #[tokio::test]
    async fn test_valid_epoch_schedules_verify_of_previous_epoch() {
        let h = harness(&[]).await;
        h.controller.handle_partitions_update(&owned(&[5]));
        h.controller.queue().try_pop().unwrap();

        h.controller.handle_epoch(EpochEvent {
            epoch: 4,
            state: ApplyState::Valid,
        });

        let item = h.controller.queue().try_pop().unwrap();
        assert_eq!(item.key(), (WorkKind::Verify, 5, 3));
    }

    #[tokio::test]
    async fn test_behind_epoch_schedules_resync() {
        let h = harness(&[]).await;
        h.controller.handle_partitions_update(&owned(&[5, 6]));
        while h.controller.queue().try_pop().is_some() {}

        h.controller.handle_epoch(EpochEvent {
            epoch: 9,
            state: ApplyState::Behind,
        });

        let kinds: Vec<WorkKind> = std::iter::from_fn(|| h.controller.queue().try_pop())
            .map(|item| item.kind)
            .collect();
        assert_eq!(kinds, vec![WorkKind::Sync, WorkKind::Sync]);
    }

    #[tokio::test]
    async fn test_inactive_partition_work_is_skipped() {
        let h = harness(&[]).await;
        let item = WorkItem::sync(7, 1);
        h.controller.queue().push(item.clone());

        h.controller.process(item.clone()).await;

        assert!(item.is_completed());
        assert_eq!(h.controller.stats().syncs_completed, 0);
        assert_eq!(h.controller.queue().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_busy_partition_is_retried_not_run() {
        let h = harness(&[]).await;
        h.controller.handle_partitions_update(&owned(&[2]));
        let item = h.controller.queue().try_pop().unwrap();
        h.controller.locker().lock(2).unwrap();

        h.controller.process(item.clone()).await;

        assert_eq!(h.controller.stats().busy_retries, 1);
        assert!(!item.is_completed());
        assert_eq!(h.controller.stats().syncs_completed, 0);
    }

    // ============================================================
    // SYNC / VERIFY TESTS
    // ============================================================

    #[tokio::test]
    async fn test_sync_pulls_missing_records_from_replica() {
        // ARRANGE: replica "b" holds a record "a" never saw
        let replica = merkle_engine();
        let h = harness(&[("b", replica.clone())]).await;
        let partition = h.ring.find_partition_id("user:1");
        let missing = record("user:1", "alice", 1);
        replica.store().set_value(partition, &missing).unwrap();
        h.advance_to(1);
        h.advance_to(2);

        // ACT
        let outcome = h.controller.sync_partition(partition, 2).await.unwrap();

        // ASSERT
        assert_eq!(outcome.peers_responded, 1);
        assert_eq!(outcome.records_applied, 1);
        assert_eq!(h.merkle.store().get_value("user:1").unwrap(), missing);
        assert_eq!(h.merkle.last_valid_epoch(partition).unwrap(), 1);

        let local = h.merkle.build_partition_tree(partition, 0, 3).unwrap();
        let remote = replica.build_partition_tree(partition, 0, 3).unwrap();
        assert_eq!(local.root(), remote.root());
    }

    #[tokio::test]
    async fn test_sync_keeps_newer_local_version() {
        // ARRANGE: "b" only saw k@1, "a" only k@2
        let replica = merkle_engine();
        let h = harness(&[("b", replica.clone())]).await;
        let partition = h.ring.find_partition_id("k");
        replica.store().set_value(partition, &record("k", "old", 1)).unwrap();
        let newer = record("k", "new", 2);
        h.merkle.store().set_value(partition, &newer).unwrap();

        // ACT
        let outcome = h.controller.sync_partition(partition, 2).await.unwrap();

        // ASSERT: k@1 is indexed, the item stays at k@2
        assert_eq!(outcome.records_applied, 1);
        assert_eq!(h.merkle.store().get_value("k").unwrap(), newer);
        let bucket = h.merkle.store().bucket_for("k");
        let epochs: Vec<i64> = h
            .merkle
            .store()
            .scan_bucket(partition, bucket, 0, 3)
            .unwrap()
            .into_iter()
            .map(|(index, _)| index.epoch)
            .collect();
        assert_eq!(epochs, vec![1, 2]);

        // ASSERT: "b" still lacks k@2, so the window is not marked valid
        assert_eq!(outcome.peers_matched, 0);
        assert_eq!(h.merkle.last_valid_epoch(partition).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sync_converges_when_replica_holds_older_versions() {
        // ARRANGE: "b" holds k@1 and k@2, "a" holds only k@2
        let replica = merkle_engine();
        let h = harness(&[("b", replica.clone())]).await;
        let partition = h.ring.find_partition_id("k");
        let latest = record("k", "two", 2);
        replica.store().set_value(partition, &record("k", "one", 1)).unwrap();
        replica.store().set_value(partition, &latest).unwrap();
        h.merkle.store().set_value(partition, &latest).unwrap();
        h.advance_to(1);
        h.advance_to(2);

        // ACT
        let outcome = h.controller.sync_partition(partition, 2).await.unwrap();

        // ASSERT
        let local = h.merkle.build_partition_tree(partition, 0, 3).unwrap();
        let remote = replica.build_partition_tree(partition, 0, 3).unwrap();
        assert_eq!(local.root(), remote.root());
        assert!(local.diff_buckets(&remote).unwrap().is_empty());
        assert_eq!(outcome.records_applied, 1);
        assert_eq!(outcome.peers_matched, 1);
        assert_eq!(h.merkle.store().get_value("k").unwrap(), latest);
        assert_eq!(h.merkle.last_valid_epoch(partition).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sync_skips_bad_record_and_applies_the_rest() {
        // ARRANGE: "b" streams an unindexable record ahead of a valid one
        let replica = merkle_engine();
        let h = harness(&[("b", replica.clone())]).await;
        let partition = h.ring.find_partition_id("user:1");
        let good = record("user:1", "alice", 1);
        replica.store().set_value(partition, &good).unwrap();
        let bad = record("bad", "x", 10_000_000_000);
        h.connector.injected.insert("b".to_string(), vec![bad]);
        let addr = "127.0.0.1:0".parse().unwrap();
        h.clients.add_member(&MemberInfo::new("b", addr, addr)).unwrap();

        // ACT
        let outcome = h.controller.sync_partition(partition, 1).await.unwrap();

        // ASSERT
        assert_eq!(outcome.records_failed, 1);
        assert_eq!(outcome.records_applied, 1);
        assert_eq!(h.merkle.store().get_value("user:1").unwrap(), good);
        assert!(matches!(
            h.merkle.store().get_value("bad"),
            Err(ClusterError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sync_succeeds_when_one_replica_is_unreachable() {
        // ARRANGE: "b" answers, "c" has no client
        let reachable = merkle_engine();
        let h = harness(&[("b", reachable.clone()), ("c", merkle_engine())]).await;
        let partition = h.ring.find_partition_id("user:7");
        let missing = record("user:7", "grace", 1);
        reachable.store().set_value(partition, &missing).unwrap();
        h.clients.remove_member("c");

        // ACT
        let outcome = h.controller.sync_partition(partition, 2).await.unwrap();

        // ASSERT
        assert_eq!(outcome.peers_responded, 1);
        assert_eq!(outcome.records_applied, 1);
        assert_eq!(h.merkle.store().get_value("user:7").unwrap(), missing);
        assert_eq!(h.merkle.last_valid_epoch(partition).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sync_fails_when_no_replica_answers() {
        let replica = merkle_engine();
        let h = harness(&[("b", replica)]).await;
        h.clients.remove_member("b");

        let result = h.controller.sync_partition(0, 1).await;

        assert!(matches!(result, Err(ClusterError::Unreachable { .. })));
    }

    #[tokio::test]
    async fn test_sync_without_replicas_only_marks_progress() {
        let h = harness(&[]).await;

        let outcome = h.controller.sync_partition(4, 3).await.unwrap();

        assert_eq!(outcome.peers_responded, 0);
        assert_eq!(h.merkle.last_valid_epoch(4).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_verify_detects_divergence_and_sync_repairs_it() {
        // ARRANGE: both replicas agree except for one record in epoch 1
        let replica = merkle_engine();
        let h = harness(&[("b", replica.clone())]).await;
        let partition = h.ring.find_partition_id("shared");
        for store in [h.merkle.store(), replica.store()] {
            store.set_value(partition, &record("shared", "x", 1)).unwrap();
        }
        let divergent = Record {
            key: "extra".to_string(),
            value: b"y".to_vec(),
            epoch: 1,
            timestamp: 150,
        };
        let extra_partition = h.ring.find_partition_id("extra");
        replica.store().set_value(extra_partition, &divergent).unwrap();

        // ACT / ASSERT: verify flags the partition holding the extra record
        let before = h.controller.verify_partition(extra_partition, 1).await.unwrap();
        assert_eq!(before.mismatched, 1);
        assert!(!before.valid);
        assert!(!h.merkle.load_tree(extra_partition, 1).unwrap().valid);

        // ACT / ASSERT: sync, then verify agrees
        h.controller.sync_partition(extra_partition, 2).await.unwrap();
        let after = h.controller.verify_partition(extra_partition, 1).await.unwrap();
        assert_eq!(after.matched, 1);
        assert!(after.valid);
        assert!(h.merkle.load_tree(extra_partition, 1).unwrap().valid);
    }

    #[tokio::test]
    async fn test_unreachable_verify_keeps_valid_sync_marker() {
        // ARRANGE: a sync marker for [0, 2) is filed under epoch 1
        let h = harness(&[("b", merkle_engine()), ("c", merkle_engine())]).await;
        let marker = EpochTreeObject {
            partition: 3,
            lower_epoch: 0,
            upper_epoch: 2,
            buckets: vec![0; BUCKETS as usize],
            valid: true,
        };
        h.merkle.persist_tree(&marker).unwrap();
        h.clients.remove_member("c");

        // ACT: "b" agrees, "c" cannot be asked
        let outcome = h.controller.verify_partition(3, 1).await.unwrap();

        // ASSERT
        assert_eq!(outcome.matched, 1);
        assert_eq!(outcome.unreachable, 1);
        assert!(!outcome.valid);
        assert_eq!(h.merkle.load_tree(3, 1).unwrap(), marker);
        assert_eq!(h.merkle.last_valid_epoch(3).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_verify_mismatch_schedules_sync() {
        let replica = merkle_engine();
        let h = harness(&[("b", replica.clone())]).await;
        h.controller.handle_partitions_update(&h.update);
        while let Some(item) = h.controller.queue().try_pop() {
            h.controller.queue().complete(&item);
        }
        let partition = h.ring.find_partition_id("only-on-b");
        replica
            .store()
            .set_value(partition, &record("only-on-b", "v", 0))
            .unwrap();
        h.advance_to(1);

        let item = WorkItem::verify(partition, 0);
        h.controller.queue().push(item.clone());
        h.controller.queue().try_pop().unwrap();
        h.controller.process(item).await;

        assert_eq!(h.controller.stats().verify_mismatches, 1);
        let next = h.controller.queue().try_pop().unwrap();
        assert_eq!(next.key(), (WorkKind::Sync, partition, 1));
    }
}
