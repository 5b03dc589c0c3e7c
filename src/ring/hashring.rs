//! Debounced Hash Ring
//!
//! ## Responsibilities
//! - **Queueing**: `add_member` / `remove_member` only record a `RingMutation`.
//! - **Debouncing**: a single background task restarts its quiet-period timer on every
//!   mutation and runs one recompute when the timer finally fires.
//! - **Publishing**: a recompute applies the queue under the write lock, then sends a
//!   `PartitionsUpdate` after the lock is released.
//! - **Queries**: partition and replica lookups take the read lock only.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use super::consistent::{ConsistentHash, RingParams};
use super::types::{PartitionsUpdate, RingMutation};
use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};

pub struct HashRing {
    local: String,
    replica_count: usize,
    state: RwLock<ConsistentHash>,
    pending: Mutex<Vec<RingMutation>>,
    trigger: mpsc::UnboundedSender<()>,
    updates: mpsc::Sender<PartitionsUpdate>,
    recomputes: AtomicU64,
}

impl HashRing {
    /// Creates the ring and spawns its debounce task on the current runtime.
    ///
    /// The task stops once the ring is dropped.
    pub fn new(config: &ClusterConfig, updates: mpsc::Sender<PartitionsUpdate>) -> Arc<Self> {
        let (trigger, triggers) = mpsc::unbounded_channel();
        let params = RingParams {
            partition_count: config.partition_count,
            virtual_nodes: config.virtual_nodes,
            load: config.load,
        };

        let ring = Arc::new(Self {
            local: config.node_name.clone(),
            replica_count: config.replica_count,
            state: RwLock::new(ConsistentHash::new(params)),
            pending: Mutex::new(Vec::new()),
            trigger,
            updates,
            recomputes: AtomicU64::new(0),
        });

        tokio::spawn(debounce_loop(
            Arc::downgrade(&ring),
            triggers,
            config.ring_debounce,
        ));

        ring
    }

    pub fn local_member(&self) -> &str {
        &self.local
    }

    pub fn replica_count(&self) -> usize {
        self.replica_count
    }

    pub fn partition_count(&self) -> u32 {
        self.state.read().params().partition_count
    }

    pub fn add_member(&self, member: &str) {
        self.enqueue(RingMutation::Add(member.to_string()));
    }

    pub fn remove_member(&self, member: &str) {
        self.enqueue(RingMutation::Remove(member.to_string()));
    }

    fn enqueue(&self, mutation: RingMutation) {
        tracing::debug!("Ring mutation queued: {:?}", mutation);
        self.pending.lock().push(mutation);
        // Send only fails once the debounce task is gone, i.e. during teardown.
        let _ = self.trigger.send(());
    }

    pub fn pending_mutations(&self) -> usize {
        self.pending.lock().len()
    }

    /// Number of recomputes run so far.
    pub fn recompute_count(&self) -> u64 {
        self.recomputes.load(Ordering::Relaxed)
    }

    /// Applies every queued mutation and publishes the resulting ownership.
    ///
    /// Normally driven by the debounce task.
    pub async fn recompute(&self) -> Result<PartitionsUpdate> {
        let update = {
            let mutations = std::mem::take(&mut *self.pending.lock());
            let mut state = self.state.write();
            for mutation in &mutations {
                match mutation {
                    RingMutation::Add(member) => {
                        if !state.add(member) {
                            tracing::debug!("Member {} already on the ring", member);
                        }
                    }
                    RingMutation::Remove(member) => {
                        if !state.remove(member) {
                            tracing::debug!("Member {} not on the ring", member);
                        }
                    }
                }
            }

            let owned = if state.member_count() == 0 {
                BTreeSet::new()
            } else {
                Self::member_partitions_locked(&state, &self.local, self.replica_count)?
                    .into_iter()
                    .collect()
            };

            PartitionsUpdate {
                members: state.members(),
                owned,
            }
        };

        self.recomputes.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "Ring recomputed: {} members, {} partitions owned locally",
            update.members.len(),
            update.owned.len()
        );

        if self.updates.send(update.clone()).await.is_err() {
            tracing::debug!("No subscriber for partition updates");
        }
        Ok(update)
    }

    pub fn find_partition_id(&self, key: &str) -> u32 {
        self.state.read().find_partition_id(key.as_bytes())
    }

    /// Up to `n` replica owners of `key` in failover order, optionally without the local member.
    pub fn get_closest_n(&self, key: &str, n: usize, include_self: bool) -> Result<Vec<String>> {
        let members = self.state.read().closest_n(key.as_bytes(), n)?;
        Ok(self.filter_self(members, include_self))
    }

    pub fn get_closest_n_for_partition(
        &self,
        partition: u32,
        n: usize,
        include_self: bool,
    ) -> Result<Vec<String>> {
        let members = self.state.read().closest_n_for_partition(partition, n)?;
        Ok(self.filter_self(members, include_self))
    }

    /// Replica owners of `partition` under the configured replica count.
    pub fn partition_owners(&self, partition: u32, include_self: bool) -> Result<Vec<String>> {
        self.get_closest_n_for_partition(partition, self.replica_count, include_self)
    }

    pub fn get_member_partitions(&self, member: &str) -> Result<Vec<u32>> {
        let state = self.state.read();
        Self::member_partitions_locked(&state, member, self.replica_count)
    }

    pub fn get_my_partitions(&self) -> Result<Vec<u32>> {
        self.get_member_partitions(&self.local)
    }

    pub fn members(&self) -> Vec<String> {
        self.state.read().members()
    }

    pub fn member_count(&self) -> usize {
        self.state.read().member_count()
    }

    /// Unhealthy while the ring is short of replicas and mutations are still waiting.
    pub fn check_health(&self) -> Result<()> {
        if self.member_count() < self.replica_count && self.pending_mutations() > 0 {
            return Err(ClusterError::Timeout(
                "waiting on ring debounce to settle".into(),
            ));
        }
        Ok(())
    }

    fn filter_self(&self, members: Vec<String>, include_self: bool) -> Vec<String> {
        if include_self {
            members
        } else {
            members.into_iter().filter(|m| *m != self.local).collect()
        }
    }

    fn member_partitions_locked(
        state: &ConsistentHash,
        member: &str,
        replica_count: usize,
    ) -> Result<Vec<u32>> {
        let mut owned = Vec::new();
        for partition in 0..state.params().partition_count {
            let owners = state.closest_n_for_partition(partition, replica_count)?;
            if owners.iter().any(|owner| owner == member) {
                owned.push(partition);
            }
        }
        Ok(owned)
    }
}

async fn debounce_loop(
    ring: Weak<HashRing>,
    mut triggers: mpsc::UnboundedReceiver<()>,
    window: Duration,
) {
    while triggers.recv().await.is_some() {
        // Every trigger inside the window restarts it.
        loop {
            match tokio::time::timeout(window, triggers.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }

        let Some(ring) = ring.upgrade() else {
            return;
        };
        if let Err(e) = ring.recompute().await {
            tracing::error!("Ring recompute failed: {}", e);
        }
    }
}
