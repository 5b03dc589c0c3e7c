use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use super::fsm::{EpochFsm, StateMachine};
use super::log::ReplicatedLog;
use super::types::{ApplyState, EpochCommand, Role};
use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};

/// The cluster-wide logical clock as seen from one node.
pub struct EpochClock {
    log: Arc<dyn ReplicatedLog>,
    fsm: Arc<EpochFsm>,
    propose_timeout: Duration,
    epoch_interval: Duration,
    auto_bootstrap: bool,
    bootstrap_timeout: Duration,
    /// Held from reading the current epoch until its successor commits.
    advance_lock: tokio::sync::Mutex<()>,
}

impl EpochClock {
    pub fn new(config: &ClusterConfig, log: Arc<dyn ReplicatedLog>, fsm: Arc<EpochFsm>) -> Self {
        Self {
            log,
            fsm,
            propose_timeout: config.default_timeout,
            epoch_interval: config.epoch_interval,
            auto_bootstrap: config.auto_bootstrap,
            bootstrap_timeout: config.bootstrap_timeout,
            advance_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn log(&self) -> &Arc<dyn ReplicatedLog> {
        &self.log
    }

    pub fn current_epoch(&self) -> i64 {
        self.fsm.epoch()
    }

    pub fn apply_state(&self) -> ApplyState {
        self.fsm.apply_state()
    }

    pub fn role(&self) -> Role {
        self.log.role()
    }

    pub fn leader(&self) -> Option<String> {
        self.log.leader()
    }

    pub fn is_leader(&self) -> bool {
        self.log.role() == Role::Leader
    }

    /// Proposes `epoch + 1` and waits for it to commit.
    ///
    /// Concurrent callers are serialized, so each one commits a distinct epoch.
    pub async fn advance_epoch(&self) -> Result<i64> {
        if !self.is_leader() {
            return Err(ClusterError::NotLeader);
        }
        let _advancing = self.advance_lock.lock().await;
        let next = self.current_epoch() + 1;
        let data = EpochCommand { epoch: next }.encode()?;

        tokio::time::timeout(self.propose_timeout, self.log.propose(data))
            .await
            .map_err(|_| ClusterError::Timeout(format!("committing epoch {}", next)))??;

        if self.current_epoch() < next {
            return Err(ClusterError::Stale(format!(
                "epoch {} committed but the clock reads {}",
                next,
                self.current_epoch()
            )));
        }

        tracing::info!("Advanced epoch to {}", next);
        Ok(next)
    }

    pub fn snapshot(&self) -> Result<Vec<u8>> {
        self.fsm.snapshot()
    }

    pub fn restore(&self, snapshot: &[u8]) -> Result<()> {
        self.fsm.restore(snapshot)
    }

    /// On a fresh cluster the first leader starts the clock at epoch 1.
    pub async fn run_leader_watch(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut leader_rx = self.log.leader_watch();
        loop {
            let leader = leader_rx.borrow_and_update().clone();
            if leader.as_deref() == Some(self.log.id()) {
                tracing::info!("{} acquired leadership", self.log.id());
                if self.current_epoch() == 0
                    && let Err(e) = self.advance_epoch().await
                {
                    tracing::warn!("Could not start the epoch clock: {}", e);
                }
            }

            tokio::select! {
                changed = leader_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    /// Advances the epoch every `epoch_interval` while leading.
    pub async fn run_ticker(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let start = tokio::time::Instant::now() + self.epoch_interval;
        let mut ticker = tokio::time::interval_at(start, self.epoch_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.is_leader() {
                        continue;
                    }
                    if let Err(e) = self.advance_epoch().await {
                        tracing::warn!("Epoch advance failed: {}", e);
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    /// Bootstraps a single-voter log when no leader appeared after `bootstrap_timeout`,
    /// and takes over when the known leader went silent.
    ///
    /// Several nodes may bootstrap at once. Their logs converge through term and name
    /// ordering when the leaders append to each other.
    pub async fn run_bootstrap(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        if !self.auto_bootstrap {
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(self.bootstrap_timeout) => {}
            _ = shutdown.recv() => return,
        }

        let role = self.log.role();
        if (role != Role::Leader && role != Role::Follower) || self.log.leader().is_none() {
            tracing::info!("No leader after {:?}, bootstrapping", self.bootstrap_timeout);
            if let Err(e) = self.log.bootstrap().await {
                tracing::error!("Bootstrap failed: {}", e);
            }
        }

        let silence = self.bootstrap_timeout + self.epoch_interval * 2;
        let mut check = tokio::time::interval(self.epoch_interval);
        loop {
            tokio::select! {
                _ = check.tick() => {
                    if self.is_leader() || self.log.leader_contact_age() < silence {
                        continue;
                    }
                    tracing::warn!(
                        "Leader {:?} silent for {:?}, taking over",
                        self.log.leader(),
                        self.log.leader_contact_age()
                    );
                    if let Err(e) = self.log.bootstrap().await {
                        tracing::error!("Takeover failed: {}", e);
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }
}
