//! Consensus Module Tests
//!
//! ## Test Scopes
//! - **State machine**: epoch monotonicity, Valid/Behind tracking, snapshots.
//! - **Log**: leadership, proposals, replication between in-process logs and
//!   resolution of concurrent bootstraps.
//! - **Clock**: epoch advance, first-leader start and auto-bootstrap (paused clock).

#[cfg(test)]
mod tests {
    use crate::config::ClusterConfig;
    use crate::consensus::clock::EpochClock;
    use crate::consensus::fsm::{EpochFsm, StateMachine};
    use crate::consensus::log::{LocalLog, LogTransport, ReplicatedLog};
    use crate::consensus::types::{ApplyState, EpochCommand, EpochEvent, LogEntry, Role};
    use crate::error::{ClusterError, Result};
    use async_trait::async_trait;
    use dashmap::DashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{broadcast, mpsc};

    fn entry(index: u64, epoch: i64) -> LogEntry {
        LogEntry {
            index,
            term: 1,
            data: EpochCommand { epoch }.encode().unwrap(),
        }
    }

    fn fsm() -> (Arc<EpochFsm>, mpsc::UnboundedReceiver<EpochEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(EpochFsm::new(tx)), rx)
    }

    /// Routes appends between logs living in the same process.
    #[derive(Default)]
    struct MemoryTransport {
        logs: DashMap<String, Arc<LocalLog>>,
    }

    #[async_trait]
    impl LogTransport for MemoryTransport {
        fn peers(&self, leader: &str) -> Vec<String> {
            self.logs
                .iter()
                .map(|e| e.key().clone())
                .filter(|name| name != leader)
                .collect()
        }

        async fn append(&self, peer: &str, leader: &str, entry: LogEntry) -> Result<()> {
            let log = self
                .logs
                .get(peer)
                .map(|e| e.value().clone())
                .ok_or_else(|| ClusterError::unreachable(peer, "unknown log"))?;
            log.append(leader, entry).await
        }
    }

    fn member(
        transport: &Arc<MemoryTransport>,
        name: &str,
    ) -> (Arc<LocalLog>, Arc<EpochFsm>, mpsc::UnboundedReceiver<EpochEvent>) {
        let (fsm, rx) = fsm();
        let log = Arc::new(LocalLog::new(
            name,
            fsm.clone(),
            Some(transport.clone() as Arc<dyn LogTransport>),
            Duration::from_secs(1),
        ));
        transport.logs.insert(name.to_string(), log.clone());
        (log, fsm, rx)
    }

    // ============================================================
    // STATE MACHINE TESTS
    // ============================================================

    #[test]
    fn test_epoch_never_decreases() {
        let (fsm, _rx) = fsm();
        let mut observed = Vec::new();

        for (index, epoch) in [(1, 1), (2, 3), (3, 2), (4, 3), (5, 5)] {
            fsm.apply(&entry(index, epoch)).unwrap();
            observed.push(fsm.epoch());
        }

        assert_eq!(observed, vec![1, 3, 3, 3, 5]);
    }

    #[test]
    fn test_stale_apply_changes_nothing() {
        let (fsm, mut rx) = fsm();
        fsm.apply(&entry(1, 4)).unwrap();
        assert_eq!(rx.try_recv().unwrap().epoch, 4);

        fsm.apply(&entry(2, 4)).unwrap();

        assert_eq!(fsm.epoch(), 4);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_gap_in_log_marks_behind() {
        let (fsm, mut rx) = fsm();
        assert_eq!(fsm.apply_state(), ApplyState::Uninitialized);

        fsm.apply(&entry(1, 1)).unwrap();
        assert_eq!(rx.try_recv().unwrap().state, ApplyState::Valid);

        fsm.apply(&entry(3, 2)).unwrap();
        assert_eq!(fsm.apply_state(), ApplyState::Behind);
        assert_eq!(rx.try_recv().unwrap().state, ApplyState::Behind);

        fsm.apply(&entry(4, 3)).unwrap();
        assert_eq!(fsm.apply_state(), ApplyState::Valid);
        assert_eq!(fsm.last_index(), 4);
    }

    #[test]
    fn test_undecodable_entry_is_invariant_violation() {
        let (fsm, _rx) = fsm();
        let garbage = LogEntry {
            index: 1,
            term: 1,
            data: vec![1, 2],
        };
        assert!(matches!(
            fsm.apply(&garbage),
            Err(ClusterError::Invariant(_))
        ));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let (fsm, _rx) = fsm();
        fsm.apply(&entry(1, 7)).unwrap();

        let snapshot = fsm.snapshot().unwrap();
        let (restored, _rx2) = self::fsm();
        restored.restore(&snapshot).unwrap();

        assert_eq!(String::from_utf8(snapshot).unwrap(), r#"{"epoch":7}"#);
        assert_eq!(restored.epoch(), 7);
    }

    // ============================================================
    // LOG TESTS
    // ============================================================

    #[tokio::test]
    async fn test_propose_requires_leadership() {
        let (fsm, _rx) = fsm();
        let log = LocalLog::new("solo", fsm, None, Duration::from_secs(1));

        assert_eq!(log.role(), Role::Candidate);
        let result = log.propose(EpochCommand { epoch: 1 }.encode().unwrap()).await;
        assert!(matches!(result, Err(ClusterError::NotLeader)));
    }

    #[tokio::test]
    async fn test_leader_replicates_to_followers() {
        // ARRANGE
        let transport = Arc::new(MemoryTransport::default());
        let (a, a_fsm, _a_rx) = member(&transport, "a");
        let (b, b_fsm, mut b_rx) = member(&transport, "b");
        a.bootstrap().await.unwrap();

        // ACT
        for epoch in 1..=3 {
            a.propose(EpochCommand { epoch }.encode().unwrap())
                .await
                .unwrap();
        }

        // ASSERT
        assert_eq!(a_fsm.epoch(), 3);
        assert_eq!(b_fsm.epoch(), 3);
        assert_eq!(b.role(), Role::Follower);
        assert_eq!(b.leader().as_deref(), Some("a"));
        assert_eq!(b.last_index(), 3);
        assert_eq!(b_rx.recv().await.unwrap().state, ApplyState::Valid);
    }

    #[tokio::test]
    async fn test_concurrent_bootstraps_converge_on_smaller_name() {
        let transport = Arc::new(MemoryTransport::default());
        let (a, _a_fsm, _a_rx) = member(&transport, "a");
        let (b, _b_fsm, _b_rx) = member(&transport, "b");
        a.bootstrap().await.unwrap();
        b.bootstrap().await.unwrap();

        // b's append is refused by a, a's append makes b step down.
        b.propose(EpochCommand { epoch: 1 }.encode().unwrap())
            .await
            .unwrap();
        assert_eq!(a.role(), Role::Leader);

        a.propose(EpochCommand { epoch: 2 }.encode().unwrap())
            .await
            .unwrap();

        assert_eq!(b.role(), Role::Follower);
        assert_eq!(b.leader().as_deref(), Some("a"));
        assert!(matches!(
            b.propose(EpochCommand { epoch: 3 }.encode().unwrap()).await,
            Err(ClusterError::NotLeader)
        ));
    }

    #[tokio::test]
    async fn test_append_from_older_term_is_rejected() {
        let transport = Arc::new(MemoryTransport::default());
        let (a, _fsm, _rx) = member(&transport, "a");
        a.bootstrap().await.unwrap();
        a.bootstrap().await.unwrap();

        let mut old = entry(1, 1);
        old.term = 0;

        assert!(matches!(
            a.append("z", old).await,
            Err(ClusterError::Stale(_))
        ));
    }

    // ============================================================
    // CLOCK TESTS
    // ============================================================

    fn clock(
        config: &ClusterConfig,
    ) -> (Arc<EpochClock>, mpsc::UnboundedReceiver<EpochEvent>) {
        let (fsm, rx) = fsm();
        let log = Arc::new(LocalLog::new(
            config.node_name.clone(),
            fsm.clone(),
            None,
            config.default_timeout,
        ));
        (Arc::new(EpochClock::new(config, log, fsm)), rx)
    }

    #[tokio::test]
    async fn test_advance_epoch_only_on_leader() {
        let config = ClusterConfig::new("node-a");
        let (clock, mut rx) = clock(&config);

        assert!(matches!(
            clock.advance_epoch().await,
            Err(ClusterError::NotLeader)
        ));

        clock.log().bootstrap().await.unwrap();
        assert_eq!(clock.advance_epoch().await.unwrap(), 1);
        assert_eq!(clock.advance_epoch().await.unwrap(), 2);

        assert_eq!(clock.current_epoch(), 2);
        assert_eq!(rx.recv().await.unwrap().epoch, 1);
        assert_eq!(rx.recv().await.unwrap().epoch, 2);
    }

    #[tokio::test]
    async fn test_concurrent_advances_commit_distinct_epochs() {
        // ARRANGE: replication to "b" suspends every proposal of "a"
        let transport = Arc::new(MemoryTransport::default());
        let (a, a_fsm, _a_rx) = member(&transport, "a");
        let (_b, b_fsm, _b_rx) = member(&transport, "b");
        a.bootstrap().await.unwrap();
        let clock = EpochClock::new(&ClusterConfig::new("a"), a, a_fsm);

        // ACT
        let (first, second, third) = tokio::join!(
            clock.advance_epoch(),
            clock.advance_epoch(),
            clock.advance_epoch()
        );

        // ASSERT
        let mut epochs = vec![first.unwrap(), second.unwrap(), third.unwrap()];
        epochs.sort_unstable();
        assert_eq!(epochs, vec![1, 2, 3]);
        assert_eq!(clock.current_epoch(), 3);
        assert_eq!(b_fsm.epoch(), 3);
    }

    #[tokio::test]
    async fn test_new_leader_starts_clock_at_one() {
        let config = ClusterConfig::new("node-a");
        let (clock, mut rx) = clock(&config);
        let (shutdown_tx, _) = broadcast::channel(1);

        let watcher = tokio::spawn(clock.clone().run_leader_watch(shutdown_tx.subscribe()));
        tokio::task::yield_now().await;
        clock.log().bootstrap().await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.epoch, 1);
        assert_eq!(event.state, ApplyState::Valid);

        shutdown_tx.send(()).unwrap();
        watcher.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_bootstrap_after_timeout() {
        // ARRANGE
        let config = ClusterConfig::new("node-a")
            .with_auto_bootstrap(true, Duration::from_secs(5))
            .with_epoch_interval(Duration::from_secs(10));
        let (clock, mut rx) = clock(&config);
        let (shutdown_tx, _) = broadcast::channel(1);

        // ACT
        tokio::spawn(clock.clone().run_leader_watch(shutdown_tx.subscribe()));
        tokio::spawn(clock.clone().run_bootstrap(shutdown_tx.subscribe()));
        tokio::spawn(clock.clone().run_ticker(shutdown_tx.subscribe()));

        // ASSERT: bootstrap, then epoch 1 from the watcher, then ticks
        assert_eq!(rx.recv().await.unwrap().epoch, 1);
        assert!(clock.is_leader());
        assert_eq!(rx.recv().await.unwrap().epoch, 2);

        let _ = shutdown_tx.send(());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_bootstrap_disabled() {
        let config = ClusterConfig::new("node-a").with_auto_bootstrap(false, Duration::from_secs(1));
        let (clock, _rx) = clock(&config);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        clock.clone().run_bootstrap(shutdown_rx).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(clock.role(), Role::Candidate);
        assert!(clock.leader().is_none());
    }
}
