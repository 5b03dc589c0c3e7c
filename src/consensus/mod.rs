//! Replicated Epoch Clock Module
//!
//! A leader-driven, monotonically increasing logical clock replicated through an
//! append-only log.
//!
//! ## Core Concepts
//! - **Log**: `ReplicatedLog` is the consensus collaborator. `LocalLog` is an in-process
//!   implementation: a bootstrapped node leads, pushes every committed entry to its peers
//!   through a `LogTransport`, and steps down when a leader with a newer term (or the
//!   same term and a smaller name) appends to it.
//! - **State machine**: `EpochFsm` applies epoch entries in log order. Entries that do not
//!   move the epoch forward are logged and ignored. Each accepted entry is reported as an
//!   `EpochEvent` carrying the new epoch and whether the log was gap-free (`Valid`) or
//!   skipped entries (`Behind`).
//! - **Clock**: `EpochClock` proposes `epoch + 1` on the leader, proposes epoch 1 right
//!   after a leader is elected on a fresh cluster, and bootstraps a single-voter log when
//!   no leader shows up in time.

pub mod clock;
pub mod fsm;
pub mod log;
pub mod types;

#[cfg(test)]
mod tests;
