//! Partition Consistency Controller Module
//!
//! Keeps every locally owned partition consistent with its replicas.
//!
//! ## Architecture Overview
//! 1. **Events**: the controller consumes `PartitionsUpdate`s from the ring and
//!    `EpochEvent`s from the epoch clock. Only its event task changes partition states.
//! 2. **Scheduling**: gaining a partition enqueues a `Sync` at the current epoch; every
//!    new epoch E enqueues a `Verify` of E-1 for each active partition.
//! 3. **Execution**: a fixed pool of workers pops the shared `WorkQueue` (lowest attempts,
//!    then epoch, then Sync before Verify). A worker must win the partition's try-lock
//!    first; on `Busy` the item is retried later instead of blocking the worker.
//!
//! ## Submodules
//! - **`queue`**: blocking priority queue with in-flight de-duplication.
//! - **`locker`**: one atomic flag per partition.
//! - **`controller`**: event handling, workers, and the Sync / Verify algorithms.

pub mod controller;
pub mod locker;
pub mod queue;
pub mod types;

#[cfg(test)]
mod tests;
