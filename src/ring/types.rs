use std::collections::BTreeSet;

/// Queued membership change, applied on the next recompute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingMutation {
    Add(String),
    Remove(String),
}

/// Published after every recompute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionsUpdate {
    /// Ring members after the recompute, sorted.
    pub members: Vec<String>,
    /// Partitions the local member is a replica owner of.
    pub owned: BTreeSet<u32>,
}
