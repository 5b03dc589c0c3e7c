//! Node Module
//!
//! The cluster context of one member. A `Node` owns the record store, the Merkle
//! engine, the hash ring, the epoch clock, the consistency controller and the peer
//! clients, and wires them together at construction. Nothing is global, so several
//! nodes can live in one process.
//!
//! ## Request Flow
//! Every request, whether from a client or a peer, enters through one bounded channel
//! as a `NodeRequest` carrying a `oneshot` reply. `RequestSender` bounds both the
//! hand-off and the wait for the reply; expiry surfaces as `ClusterError::Timeout`.
//!
//! ## Event Flow
//! - Membership events -> ring mutations and client registrations.
//! - Ring `PartitionsUpdate`s and clock `EpochEvent`s -> consistency controller.

pub mod node;
pub mod transport;
pub mod types;
