//! Storage Module
//!
//! The ordered key-value layer the anti-entropy engine is built on.
//!
//! ## Core Concepts
//! - **Engine**: `Storage` is the collaborator contract (put / get / ordered range
//!   iteration). `MemoryStorage` is the in-process implementation.
//! - **Index keys**: `index` encodes `(partition, bucket, epoch, key)` into sortable
//!   strings so one range scan returns exactly one bucket's records for an epoch window.
//! - **Records**: `RecordStore` writes a record under its item key and its epoch index
//!   key, rejecting writes older than the stored value.

pub mod engine;
pub mod index;
pub mod records;
pub mod types;
