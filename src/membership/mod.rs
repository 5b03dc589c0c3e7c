//! Membership & Discovery Module
//!
//! Gossip-based membership (inspired by SWIM). This is the collaborator that tells
//! the node who is in the cluster; the node only consumes its `MembershipEvent`s.
//!
//! ## Core Mechanisms
//! - **Gossip Protocol**: members ping a random peer every 500ms over UDP; acks carry the whole table.
//! - **Failure Detection**: silent members go Suspect, then Dead. Death emits `Leave`.
//! - **Incarnation Numbers**: a member refutes suspicion by raising its own incarnation.

pub mod service;
pub mod types;
