use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinSet;

use super::fsm::StateMachine;
use super::types::{LogEntry, Role};
use crate::error::{ClusterError, Result};

/// The consensus collaborator: a replicated, ordered log with a single leader.
#[async_trait]
pub trait ReplicatedLog: Send + Sync {
    fn id(&self) -> &str;

    fn role(&self) -> Role;

    fn leader(&self) -> Option<String>;

    /// Fires whenever the known leader changes.
    fn leader_watch(&self) -> watch::Receiver<Option<String>>;

    /// Time since the last contact with a leader (or since start-up).
    fn leader_contact_age(&self) -> Duration;

    /// Appends `data` on the leader. Returns the committed index.
    async fn propose(&self, data: Vec<u8>) -> Result<u64>;

    /// Makes this node the single voter and leader of a new term.
    async fn bootstrap(&self) -> Result<()>;

    /// Accepts an entry replicated by `leader`.
    async fn append(&self, leader: &str, entry: LogEntry) -> Result<()>;
}

/// Carries committed entries from the leader to the other members.
#[async_trait]
pub trait LogTransport: Send + Sync {
    /// Members the leader replicates to; never includes the leader itself.
    fn peers(&self, leader: &str) -> Vec<String>;

    async fn append(&self, peer: &str, leader: &str, entry: LogEntry) -> Result<()>;
}

#[derive(Debug)]
struct LogState {
    role: Role,
    term: u64,
    last_index: u64,
    leader: Option<String>,
    last_contact: Instant,
}

pub struct LocalLog {
    id: String,
    fsm: Arc<dyn StateMachine>,
    state: Mutex<LogState>,
    /// Keeps proposals, and therefore replication, in index order.
    propose_lock: tokio::sync::Mutex<()>,
    leader_tx: watch::Sender<Option<String>>,
    transport: Option<Arc<dyn LogTransport>>,
    append_timeout: Duration,
}

impl LocalLog {
    pub fn new(
        id: impl Into<String>,
        fsm: Arc<dyn StateMachine>,
        transport: Option<Arc<dyn LogTransport>>,
        append_timeout: Duration,
    ) -> Self {
        let (leader_tx, _) = watch::channel(None);
        Self {
            id: id.into(),
            fsm,
            state: Mutex::new(LogState {
                role: Role::Candidate,
                term: 0,
                last_index: 0,
                leader: None,
                last_contact: Instant::now(),
            }),
            propose_lock: tokio::sync::Mutex::new(()),
            leader_tx,
            transport,
            append_timeout,
        }
    }

    pub fn term(&self) -> u64 {
        self.state.lock().term
    }

    pub fn last_index(&self) -> u64 {
        self.state.lock().last_index
    }

    fn apply_or_die(&self, entry: &LogEntry) {
        if let Err(e) = self.fsm.apply(entry) {
            tracing::error!("Fatal: applying log entry {} failed: {}", entry.index, e);
            panic!("replicated log apply failed at index {}: {}", entry.index, e);
        }
    }

    async fn replicate(&self, entry: &LogEntry) {
        let Some(transport) = &self.transport else {
            return;
        };

        let mut appends = JoinSet::new();
        for peer in transport.peers(&self.id) {
            let transport = transport.clone();
            let leader = self.id.clone();
            let entry = entry.clone();
            let timeout = self.append_timeout;
            appends.spawn(async move {
                let result =
                    tokio::time::timeout(timeout, transport.append(&peer, &leader, entry)).await;
                (peer, result)
            });
        }

        while let Some(joined) = appends.join_next().await {
            match joined {
                Ok((_, Ok(Ok(())))) => {}
                Ok((peer, Ok(Err(e)))) => {
                    tracing::warn!("Peer {} rejected entry {}: {}", peer, entry.index, e)
                }
                Ok((peer, Err(_))) => {
                    tracing::warn!("Peer {} timed out on entry {}", peer, entry.index)
                }
                Err(e) => tracing::error!("Replication task failed: {}", e),
            }
        }
    }
}

#[async_trait]
impl ReplicatedLog for LocalLog {
    fn id(&self) -> &str {
        &self.id
    }

    fn role(&self) -> Role {
        self.state.lock().role
    }

    fn leader(&self) -> Option<String> {
        self.state.lock().leader.clone()
    }

    fn leader_watch(&self) -> watch::Receiver<Option<String>> {
        self.leader_tx.subscribe()
    }

    fn leader_contact_age(&self) -> Duration {
        self.state.lock().last_contact.elapsed()
    }

    async fn propose(&self, data: Vec<u8>) -> Result<u64> {
        let _ordered = self.propose_lock.lock().await;

        let entry = {
            let mut state = self.state.lock();
            if state.role != Role::Leader {
                return Err(ClusterError::NotLeader);
            }
            state.last_index += 1;
            let entry = LogEntry {
                index: state.last_index,
                term: state.term,
                data,
            };
            self.apply_or_die(&entry);
            entry
        };

        self.replicate(&entry).await;
        Ok(entry.index)
    }

    async fn bootstrap(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.role == Role::Leader {
                return Ok(());
            }
            state.term += 1;
            state.role = Role::Leader;
            state.leader = Some(self.id.clone());
            state.last_contact = Instant::now();
            tracing::info!("{} bootstrapped the log as leader of term {}", self.id, state.term);
        }
        self.leader_tx.send_replace(Some(self.id.clone()));
        Ok(())
    }

    async fn append(&self, leader: &str, entry: LogEntry) -> Result<()> {
        let leader_changed = {
            let mut state = self.state.lock();
            if entry.term < state.term {
                return Err(ClusterError::Stale(format!(
                    "entry term {} is behind term {}",
                    entry.term, state.term
                )));
            }
            if state.role == Role::Leader && entry.term == state.term && leader != self.id {
                if leader > self.id.as_str() {
                    return Err(ClusterError::Stale(format!(
                        "{} also leads term {}",
                        self.id, state.term
                    )));
                }
                tracing::warn!(
                    "{} stepping down: {} leads term {}",
                    self.id,
                    leader,
                    entry.term
                );
            }

            let same_leader = state.leader.as_deref() == Some(leader);
            let duplicate =
                same_leader && entry.term == state.term && entry.index <= state.last_index;

            state.term = entry.term;
            state.role = Role::Follower;
            state.leader = Some(leader.to_string());
            state.last_contact = Instant::now();

            if !duplicate {
                state.last_index = entry.index;
                self.apply_or_die(&entry);
            }
            !same_leader
        };

        if leader_changed {
            tracing::info!("{} now follows {}", self.id, leader);
            self.leader_tx.send_replace(Some(leader.to_string()));
        }
        Ok(())
    }
}
