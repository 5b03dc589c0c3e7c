use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};

use super::transport::PeerLogTransport;
use super::types::{NodeRequest, RequestSender};
use crate::config::ClusterConfig;
use crate::consensus::clock::EpochClock;
use crate::consensus::fsm::EpochFsm;
use crate::consensus::log::LocalLog;
use crate::consensus::types::ApplyState;
use crate::controller::controller::ConsistencyController;
use crate::error::{ClusterError, Result};
use crate::membership::types::MembershipEvent;
use crate::merkle::engine::MerkleEngine;
use crate::ring::hashring::HashRing;
use crate::storage::engine::Storage;
use crate::storage::index::EpochIndexCodec;
use crate::storage::records::{RecordStore, WriteOutcome};
use crate::storage::types::Record;
use crate::transport::client::{ClientManager, PeerConnector, cluster_error};
use crate::transport::protocol::{HealthResponse, SetResponse};

/// Storage key of the persisted epoch clock snapshot.
pub const SNAPSHOT_KEY: &str = "snapshot_epochclock";

pub struct Node {
    config: ClusterConfig,
    store: Arc<RecordStore>,
    merkle: Arc<MerkleEngine>,
    ring: Arc<HashRing>,
    clock: Arc<EpochClock>,
    controller: Arc<ConsistencyController>,
    clients: Arc<ClientManager>,
    sender: RequestSender,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Builds every component, restores the clock snapshot if one was persisted and
    /// starts the background tasks on the current runtime.
    pub fn start(
        config: ClusterConfig,
        storage: Arc<dyn Storage>,
        connector: Arc<dyn PeerConnector>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let name = config.node_name.clone();

        let store = Arc::new(RecordStore::new(
            Arc::clone(&storage),
            EpochIndexCodec::new(config.epoch_pad_width),
            config.partition_buckets,
        ));
        let merkle = Arc::new(MerkleEngine::new(Arc::clone(&store)));

        let (updates_tx, updates_rx) = mpsc::channel(64);
        let ring = HashRing::new(&config, updates_tx);
        ring.add_member(&name);

        let clients = Arc::new(ClientManager::new(connector));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let fsm = Arc::new(EpochFsm::new(events_tx));
        let log_transport = Arc::new(PeerLogTransport::new(
            Arc::clone(&ring),
            Arc::clone(&clients),
        ));
        let log = Arc::new(LocalLog::new(
            name.clone(),
            fsm.clone(),
            Some(log_transport),
            config.default_timeout,
        ));
        let clock = Arc::new(EpochClock::new(&config, log, fsm));

        match storage.get(SNAPSHOT_KEY.as_bytes()) {
            Ok(snapshot) => clock.restore(&snapshot)?,
            Err(ClusterError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let controller = ConsistencyController::new(
            &config,
            Arc::clone(&ring),
            Arc::clone(&clock),
            Arc::clone(&merkle),
            Arc::clone(&clients),
        );

        let (requests_tx, requests_rx) = mpsc::channel(config.request_channel_size);
        let sender = RequestSender::new(name.clone(), requests_tx, config.default_timeout);
        let (shutdown, _) = broadcast::channel(1);

        let node = Arc::new(Self {
            config,
            store,
            merkle,
            ring,
            clock,
            controller,
            clients,
            sender,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = node
            .controller
            .spawn(updates_rx, events_rx, &node.shutdown);
        tasks.push(tokio::spawn(
            Arc::clone(&node.clock).run_leader_watch(node.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&node.clock).run_ticker(node.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&node.clock).run_bootstrap(node.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&node).run_requests(requests_rx, node.shutdown.subscribe()),
        ));
        node.tasks.lock().extend(tasks);

        tracing::info!(
            "Node {} started (partitions: {}, replicas: {}, epoch: {})",
            node.name(),
            node.config.partition_count,
            node.config.replica_count,
            node.clock.current_epoch()
        );
        Ok(node)
    }

    pub fn name(&self) -> &str {
        &self.config.node_name
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn merkle(&self) -> &Arc<MerkleEngine> {
        &self.merkle
    }

    pub fn ring(&self) -> &Arc<HashRing> {
        &self.ring
    }

    pub fn clock(&self) -> &Arc<EpochClock> {
        &self.clock
    }

    pub fn controller(&self) -> &Arc<ConsistencyController> {
        &self.controller
    }

    pub fn clients(&self) -> &Arc<ClientManager> {
        &self.clients
    }

    pub fn sender(&self) -> &RequestSender {
        &self.sender
    }

    pub fn shutdown_signal(&self) -> &broadcast::Sender<()> {
        &self.shutdown
    }

    // ============================================================
    // MEMBERSHIP
    // ============================================================

    pub fn handle_membership(&self, event: MembershipEvent) {
        match event {
            MembershipEvent::Join(member) => {
                if member.name == self.name() {
                    return;
                }
                if let Err(e) = self.clients.add_member(&member) {
                    tracing::warn!("No client for {}: {}", member.name, e);
                }
                self.ring.add_member(&member.name);
            }
            MembershipEvent::Leave(name) => {
                if name == self.name() {
                    return;
                }
                self.ring.remove_member(&name);
                self.clients.remove_member(&name);
            }
            MembershipEvent::Update(member) => {
                if let Err(e) = self.clients.add_member(&member) {
                    tracing::warn!("Could not refresh client for {}: {}", member.name, e);
                }
            }
        }
    }

    /// Feeds membership events into the node until shutdown.
    pub fn attach_membership(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<MembershipEvent>) {
        let node = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(event) = events.recv() => node.handle_membership(event),
                    _ = shutdown.recv() => break,
                    else => break,
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    // ============================================================
    // REQUEST LOOP
    // ============================================================

    async fn run_requests(
        self: Arc<Self>,
        mut requests: mpsc::Receiver<NodeRequest>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                Some(request) = requests.recv() => {
                    let node = Arc::clone(&self);
                    tokio::spawn(async move { node.dispatch(request).await });
                }
                _ = shutdown.recv() => break,
                else => break,
            }
        }
        tracing::info!("Request loop of {} stopped", self.name());
    }

    pub async fn dispatch(&self, request: NodeRequest) {
        // A dropped receiver means the caller timed out; the answer is discarded.
        match request {
            NodeRequest::Set { key, value, reply } => {
                let _ = reply.send(self.set(&key, value).await);
            }
            NodeRequest::Get { key, reply } => {
                let _ = reply.send(self.get(&key).await);
            }
            NodeRequest::SetValue {
                partition,
                record,
                reply,
            } => {
                let _ = reply.send(self.set_value(partition, &record));
            }
            NodeRequest::GetValue { key, reply } => {
                let _ = reply.send(self.get_value(&key));
            }
            NodeRequest::StreamBuckets { request, reply } => {
                let _ = reply.send(self.store.stream_buckets(
                    request.partition,
                    &request.buckets,
                    request.lower_epoch,
                    request.upper_epoch,
                ));
            }
            NodeRequest::EpochTree { request, reply } => {
                let _ = reply.send(self.merkle.epoch_tree(
                    request.partition,
                    request.lower_epoch,
                    request.upper_epoch,
                ));
            }
            NodeRequest::EpochTreeLastValid { partition, reply } => {
                let _ = reply.send(self.merkle.last_valid_tree(partition));
            }
            NodeRequest::AppendEpoch { request, reply } => {
                let _ = reply.send(self.clock.log().append(&request.leader, request.entry).await);
            }
            NodeRequest::Health { reply } => {
                let _ = reply.send(Ok(self.health()));
            }
        }
    }

    // ============================================================
    // QUORUM OPERATIONS
    // ============================================================

    /// Stamps the value with the current epoch and writes it to the partition's replicas.
    ///
    /// Succeeds once `write_quorum` replicas acknowledged within the default timeout.
    /// Replicas still pending at that point keep writing in the background.
    pub async fn set(&self, key: &str, value: Vec<u8>) -> Result<SetResponse> {
        let epoch = self.clock.current_epoch();
        let record = Record::new(key, value, epoch);
        let partition = self.ring.find_partition_id(key);
        let replicas = self.ring.partition_owners(partition, true)?;
        let needed = self.config.write_quorum;
        if replicas.len() < needed {
            return Err(ClusterError::unreachable(
                format!("write quorum of partition {}", partition),
                format!("{} replicas for a quorum of {}", replicas.len(), needed),
            ));
        }

        let mut pending = JoinSet::new();
        for replica in replicas {
            let record = record.clone();
            if replica == self.name() {
                let store = Arc::clone(&self.store);
                pending.spawn(async move {
                    (replica, store.set_value(partition, &record).map(|_| ()))
                });
                continue;
            }
            match self.clients.get(&replica) {
                Ok(client) => {
                    pending.spawn(async move {
                        let result = client
                            .set_value(partition, &record)
                            .await
                            .map(|_| ())
                            .map_err(|e| remote_error(&replica, e));
                        (replica, result)
                    });
                }
                Err(e) => tracing::warn!("Replica {} skipped for {}: {}", replica, key, e),
            }
        }

        let acks = self
            .collect_quorum(&mut pending, needed, |(replica, result)| match result {
                Ok(()) => Some(()),
                Err(e) => {
                    tracing::warn!("Replica {} rejected write of {}: {}", replica, key, e);
                    None
                }
            })
            .await?
            .len();
        pending.detach_all();

        Ok(SetResponse {
            success: true,
            epoch,
            acks,
        })
    }

    /// Reads `key` from `read_quorum` replicas and returns the newest version.
    pub async fn get(&self, key: &str) -> Result<Record> {
        let partition = self.ring.find_partition_id(key);
        let replicas = self.ring.partition_owners(partition, true)?;
        let needed = self.config.read_quorum;
        if replicas.len() < needed {
            return Err(ClusterError::unreachable(
                format!("read quorum of partition {}", partition),
                format!("{} replicas for a quorum of {}", replicas.len(), needed),
            ));
        }

        let mut pending = JoinSet::new();
        for replica in replicas {
            let key = key.to_string();
            if replica == self.name() {
                let store = Arc::clone(&self.store);
                pending.spawn(async move {
                    let result = match store.get_value(&key) {
                        Ok(record) => Ok(Some(record)),
                        Err(ClusterError::NotFound(_)) => Ok(None),
                        Err(e) => Err(e),
                    };
                    (replica, result)
                });
                continue;
            }
            match self.clients.get(&replica) {
                Ok(client) => {
                    pending.spawn(async move {
                        let result = client
                            .get_value(&key)
                            .await
                            .map_err(|e| remote_error(&replica, e));
                        (replica, result)
                    });
                }
                Err(e) => tracing::warn!("Replica {} skipped for {}: {}", replica, key, e),
            }
        }

        let replies = self
            .collect_quorum(&mut pending, needed, |(replica, result)| match result {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!("Replica {} failed read of {}: {}", replica, key, e);
                    None
                }
            })
            .await?;

        replies
            .into_iter()
            .flatten()
            .max_by_key(Record::version)
            .ok_or_else(|| ClusterError::NotFound(key.to_string()))
    }

    /// Waits until `needed` replies were accepted by `accept`, or the default timeout.
    async fn collect_quorum<R, T>(
        &self,
        pending: &mut JoinSet<R>,
        needed: usize,
        mut accept: impl FnMut(R) -> Option<T>,
    ) -> Result<Vec<T>>
    where
        R: Send + 'static,
    {
        let deadline = tokio::time::sleep(self.config.default_timeout);
        tokio::pin!(deadline);

        let mut accepted = Vec::with_capacity(needed);
        while accepted.len() < needed {
            tokio::select! {
                joined = pending.join_next() => match joined {
                    Some(Ok(reply)) => {
                        if let Some(value) = accept(reply) {
                            accepted.push(value);
                        }
                    }
                    Some(Err(e)) => tracing::error!("Replica task failed: {}", e),
                    None => break,
                },
                _ = &mut deadline => {
                    return Err(ClusterError::Timeout(format!(
                        "{} of {} replicas answered within {:?}",
                        accepted.len(),
                        needed,
                        self.config.default_timeout
                    )));
                }
            }
        }

        if accepted.len() < needed {
            return Err(ClusterError::unreachable(
                "quorum",
                format!("only {} of {} replicas succeeded", accepted.len(), needed),
            ));
        }
        Ok(accepted)
    }

    // ============================================================
    // REPLICA OPERATIONS
    // ============================================================

    /// Stores a record sent by a write coordinator or pulled during sync.
    ///
    /// Records more than one epoch behind the local clock are refused as stale.
    pub fn set_value(&self, partition: u32, record: &Record) -> Result<bool> {
        let current = self.clock.current_epoch();
        if record.epoch < current - 1 {
            tracing::warn!(
                "Rejected {} stamped with epoch {} (current epoch {})",
                record.key,
                record.epoch,
                current
            );
            return Err(ClusterError::Stale(format!(
                "epoch {} lags current epoch {}",
                record.epoch, current
            )));
        }

        let expected = self.ring.find_partition_id(&record.key);
        if partition != expected {
            return Err(ClusterError::Encoding(format!(
                "{} belongs to partition {}, not {}",
                record.key, expected, partition
            )));
        }

        Ok(self.store.set_value(partition, record)? == WriteOutcome::Written)
    }

    pub fn get_value(&self, key: &str) -> Result<Option<Record>> {
        match self.store.get_value(key) {
            Ok(record) => Ok(Some(record)),
            Err(ClusterError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn health(&self) -> HealthResponse {
        let apply_state = self.clock.apply_state();
        let leader = self.clock.leader();

        let message = if apply_state == ApplyState::Uninitialized {
            Some("epoch clock not initialized".to_string())
        } else if leader.is_none() {
            Some("no epoch leader".to_string())
        } else {
            self.ring.check_health().err().map(|e| e.to_string())
        };

        HealthResponse {
            member: self.name().to_string(),
            healthy: message.is_none(),
            epoch: self.clock.current_epoch(),
            apply_state,
            role: self.clock.role(),
            leader,
            ring_members: self.ring.member_count(),
            active_partitions: self.controller.active_count(),
            queued_work: self.controller.queue().len(),
            stats: self.controller.stats(),
            message,
        }
    }

    // ============================================================
    // SHUTDOWN
    // ============================================================

    /// Persists the clock snapshot, then stops every background task.
    pub async fn shutdown(&self) -> Result<()> {
        let snapshot = self.clock.snapshot()?;
        if let Err(e) = self
            .store
            .storage()
            .put(SNAPSHOT_KEY.as_bytes(), &snapshot)
        {
            tracing::error!("Persisting the epoch snapshot failed: {}", e);
            return Err(ClusterError::Invariant(format!(
                "snapshot persist failed: {}",
                e
            )));
        }

        let _ = self.shutdown.send(());
        self.controller.queue().close();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Task of {} ended abnormally: {}", self.name(), e);
            }
        }
        tracing::info!(
            "Node {} stopped at epoch {}",
            self.name(),
            self.clock.current_epoch()
        );
        Ok(())
    }
}

/// Keeps the peer's error class when it answered with one.
fn remote_error(peer: &str, err: anyhow::Error) -> ClusterError {
    match cluster_error(&err) {
        Some(ClusterError::Stale(message)) => ClusterError::Stale(message.clone()),
        Some(ClusterError::Timeout(message)) => ClusterError::Timeout(message.clone()),
        Some(ClusterError::NotFound(message)) => ClusterError::NotFound(message.clone()),
        _ => ClusterError::unreachable(peer, err),
    }
}
