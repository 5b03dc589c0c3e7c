use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::time::Instant;

/// Identity and addresses of one cluster member. The name is its ring identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MemberInfo {
    pub name: String,
    pub gossip_addr: SocketAddr,
    pub http_addr: SocketAddr,
}

impl MemberInfo {
    pub fn new(name: impl Into<String>, gossip_addr: SocketAddr, http_addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            gossip_addr,
            http_addr,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MemberState {
    Alive,
    Suspect,
    Dead,
}

/// A member as seen by the local gossip table.
///
/// `incarnation` is a logical clock owned by the member itself; a higher value
/// always wins, which is how a member refutes a false suspicion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub info: MemberInfo,
    pub state: MemberState,
    pub incarnation: u64,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

/// Gossip datagrams, bincode-encoded.
///
/// - `Ping/Ack`: liveness probes; an ack carries the sender's whole table.
/// - `Join`: sent to seeds by a starting member.
/// - `Suspect/Alive`: health changes spread to every alive member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Ping {
        from: MemberInfo,
        incarnation: u64,
    },

    Ack {
        from: String,
        incarnation: u64,
        members: Vec<Member>,
    },

    Join {
        member: Member,
    },

    Suspect {
        name: String,
        incarnation: u64,
    },

    Alive {
        name: String,
        incarnation: u64,
    },
}

/// Notifications consumed by the node: joins and leaves drive the ring and the
/// client manager, updates refresh a member's addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Join(MemberInfo),
    Leave(String),
    Update(MemberInfo),
}
