//! Transport Module
//!
//! Everything that crosses a node boundary.
//!
//! ## Submodules
//! - **`protocol`**: endpoint paths and the DTOs exchanged over HTTP.
//! - **`client`**: the `PeerClient` seam, its reqwest implementation and the
//!   `ClientManager` that tracks one client per ring member.
//! - **`local`**: an in-process transport that talks straight to a node's request
//!   channel. Used to run whole clusters inside one test.
//! - **`handlers`**: axum handlers forwarding HTTP requests into the node's request loop.

pub mod client;
pub mod handlers;
pub mod local;
pub mod protocol;
