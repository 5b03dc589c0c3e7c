//! Consistent Hash Ring Module
//!
//! Maps the fixed partition space onto the current member set.
//!
//! ## Core Concepts
//! - **Bounded-load placement**: every member places `virtual_nodes` points on the ring.
//!   Each partition goes to the first point clockwise of its hash whose member still has
//!   room under `ceil(partition_count / members * load)`.
//! - **Replica sets**: the owners of a partition are its placement owner followed by the
//!   next members in name-hash order.
//! - **Debounced mutations**: joins and leaves are queued and applied together once
//!   membership has been quiet for `ring_debounce`. Every recompute publishes a
//!   `PartitionsUpdate` with the partitions the local member now owns.

pub mod consistent;
pub mod hashring;
pub mod types;
