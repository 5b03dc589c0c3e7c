//! Epoch-Gated Replicated Key-Value Store
//!
//! This library crate defines the modules of one cluster node. The binary (`main.rs`)
//! wires them to UDP gossip and an HTTP listener.
//!
//! ## Architecture Modules
//! - **`config`**: cluster-wide tunables and their validation.
//! - **`consensus`**: the replicated epoch log, its state machine and the epoch clock.
//! - **`controller`**: per-partition consistency. Runs sync and verify work off a
//!   prioritized queue and tracks which partitions are active.
//! - **`membership`**: SWIM-like gossip that reports joins, leaves and address changes.
//! - **`merkle`**: per-bucket hash accumulators and the epoch trees built from them.
//! - **`node`**: the request loop, quorum reads and writes, and node lifecycle.
//! - **`ring`**: consistent hashing with bounded load and debounced recomputes.
//! - **`storage`**: ordered key-value engine plus the record and epoch index layout.
//! - **`transport`**: peer clients (HTTP and in-process) and the axum routes.

pub mod config;
pub mod consensus;
pub mod controller;
pub mod error;
pub mod membership;
pub mod merkle;
pub mod node;
pub mod ring;
pub mod storage;
pub mod transport;
