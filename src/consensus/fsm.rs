use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::types::{ApplyState, EpochCommand, EpochEvent, EpochSnapshot, LogEntry};
use crate::error::{ClusterError, Result};

/// State machine driven by the replicated log.
///
/// `apply` is called once per committed entry, in log order. An `Err` means the
/// state machine can no longer be trusted and the caller must stop.
pub trait StateMachine: Send + Sync {
    fn apply(&self, entry: &LogEntry) -> Result<()>;
    fn snapshot(&self) -> Result<Vec<u8>>;
    fn restore(&self, snapshot: &[u8]) -> Result<()>;
}

#[derive(Debug)]
struct FsmState {
    epoch: i64,
    last_index: u64,
    apply_state: ApplyState,
}

pub struct EpochFsm {
    state: Mutex<FsmState>,
    events: mpsc::UnboundedSender<EpochEvent>,
}

impl EpochFsm {
    pub fn new(events: mpsc::UnboundedSender<EpochEvent>) -> Self {
        Self {
            state: Mutex::new(FsmState {
                epoch: 0,
                last_index: 0,
                apply_state: ApplyState::Uninitialized,
            }),
            events,
        }
    }

    pub fn epoch(&self) -> i64 {
        self.state.lock().epoch
    }

    pub fn apply_state(&self) -> ApplyState {
        self.state.lock().apply_state
    }

    pub fn last_index(&self) -> u64 {
        self.state.lock().last_index
    }
}

impl StateMachine for EpochFsm {
    fn apply(&self, entry: &LogEntry) -> Result<()> {
        let command = EpochCommand::decode(&entry.data).map_err(|e| {
            ClusterError::Invariant(format!("undecodable epoch entry {}: {}", entry.index, e))
        })?;

        let event = {
            let mut state = self.state.lock();
            let contiguous = entry.index == state.last_index + 1;
            state.last_index = entry.index;

            if command.epoch <= state.epoch {
                tracing::warn!(
                    "Ignoring stale epoch {} at index {} (current epoch {})",
                    command.epoch,
                    entry.index,
                    state.epoch
                );
                return Ok(());
            }

            state.epoch = command.epoch;
            state.apply_state = if contiguous {
                ApplyState::Valid
            } else {
                ApplyState::Behind
            };
            EpochEvent {
                epoch: state.epoch,
                state: state.apply_state,
            }
        };

        tracing::debug!("Applied epoch {} ({:?})", event.epoch, event.state);
        // Nobody listening only happens while the node shuts down.
        let _ = self.events.send(event);
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        let snapshot = EpochSnapshot {
            epoch: self.epoch(),
        };
        Ok(serde_json::to_vec(&snapshot)?)
    }

    fn restore(&self, snapshot: &[u8]) -> Result<()> {
        let snapshot: EpochSnapshot = serde_json::from_slice(snapshot)?;
        let mut state = self.state.lock();
        state.epoch = snapshot.epoch;
        tracing::info!("Restored epoch {} from snapshot", snapshot.epoch);
        Ok(())
    }
}
