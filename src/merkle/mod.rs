//! Merkle Anti-Entropy Module
//!
//! Detects divergence between replicas of a partition without shipping the data.
//!
//! ## Core Concepts
//! - **Bucket hash**: an order-independent accumulator over every record a bucket
//!   holds for an epoch window. Records can be folded in any order and removed again.
//! - **Tree**: a binary SHA-256 tree over the bucket hashes of a partition. Roots are
//!   compared first; only when they differ are the leaves walked to find the buckets
//!   that need repair.
//! - **Epoch tree objects**: the wire form of a tree (`EpochTreeObject`). Verified trees
//!   are persisted under `epochtree_<partition>_<epoch>` and the newest valid one marks
//!   how far a partition is known to be consistent.

pub mod engine;
pub mod hash;
pub mod tree;
pub mod types;
