//! Cluster Error Taxonomy
//!
//! Every component reports failures through `ClusterError`. The variants fall into
//! three groups:
//!
//! - **Expected** (`Stale`, `Busy`, `NotFound`): resolved at the component boundary,
//!   logged and turned into a no-op or a distinct result.
//! - **Retryable** (`Timeout`, `Unreachable`, `NotLeader`, `NoMembers`): returned to the
//!   immediate caller as an explicit value.
//! - **Fatal** (`Invariant`): a programming or data-corruption bug. The owning task
//!   logs it and terminates instead of continuing in an unknown state.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    /// An epoch apply or write carried a value older than the one already held.
    #[error("stale: {0}")]
    Stale(String),

    /// The partition is already being synced or verified.
    #[error("partition {0} is busy")]
    Busy(u32),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("peer {peer} unreachable: {reason}")]
    Unreachable { peer: String, reason: String },

    #[error("ring has no members")]
    NoMembers,

    #[error("not the leader")]
    NotLeader,

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid config: {0}")]
    Config(String),
}

impl ClusterError {
    /// Expected conditions never need to be surfaced as hard failures.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            ClusterError::Stale(_) | ClusterError::Busy(_) | ClusterError::NotFound(_)
        )
    }

    /// Stable name of the variant, carried in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterError::Stale(_) => "stale",
            ClusterError::Busy(_) => "busy",
            ClusterError::Timeout(_) => "timeout",
            ClusterError::NotFound(_) => "not_found",
            ClusterError::Unreachable { .. } => "unreachable",
            ClusterError::NoMembers => "no_members",
            ClusterError::NotLeader => "not_leader",
            ClusterError::Invariant(_) => "invariant",
            ClusterError::Encoding(_) => "encoding",
            ClusterError::Storage(_) => "storage",
            ClusterError::Config(_) => "config",
        }
    }

    /// Rebuilds an error reported by a peer. `peer` names the remote for variants
    /// that carry one; unknown kinds become `Storage`.
    pub fn from_kind(kind: &str, message: String, peer: &str) -> Self {
        match kind {
            "stale" => ClusterError::Stale(message),
            "busy" => ClusterError::Busy(
                message
                    .rsplit(' ')
                    .find_map(|word| word.parse().ok())
                    .unwrap_or_default(),
            ),
            "timeout" => ClusterError::Timeout(message),
            "not_found" => ClusterError::NotFound(message),
            "unreachable" => ClusterError::unreachable(peer, message),
            "no_members" => ClusterError::NoMembers,
            "not_leader" => ClusterError::NotLeader,
            "invariant" => ClusterError::Invariant(message),
            "encoding" => ClusterError::Encoding(message),
            "config" => ClusterError::Config(message),
            _ => ClusterError::Storage(message),
        }
    }

    pub fn unreachable(peer: impl Into<String>, reason: impl ToString) -> Self {
        ClusterError::Unreachable {
            peer: peer.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<bincode::Error> for ClusterError {
    fn from(err: bincode::Error) -> Self {
        ClusterError::Encoding(err.to_string())
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Encoding(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ClusterError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        ClusterError::Timeout(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        let errors = vec![
            ClusterError::Stale("k".into()),
            ClusterError::Timeout("t".into()),
            ClusterError::NotFound("k".into()),
            ClusterError::NoMembers,
            ClusterError::NotLeader,
            ClusterError::Invariant("x".into()),
        ];
        for err in errors {
            let rebuilt = ClusterError::from_kind(err.kind(), String::new(), "peer");
            assert_eq!(rebuilt.kind(), err.kind());
        }
    }

    #[test]
    fn test_busy_partition_survives_round_trip() {
        let err = ClusterError::Busy(17);
        let rebuilt = ClusterError::from_kind(err.kind(), err.to_string(), "peer");
        assert!(matches!(rebuilt, ClusterError::Busy(17)));
    }
}
