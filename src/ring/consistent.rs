use std::collections::BTreeMap;

use xxhash_rust::xxh3::xxh3_64;

use crate::error::{ClusterError, Result};

fn hash(bytes: &[u8]) -> u64 {
    xxh3_64(bytes)
}

/// Parameters of the placement function. Identical parameters and member sets always
/// yield identical placements.
#[derive(Debug, Clone, Copy)]
pub struct RingParams {
    pub partition_count: u32,
    pub virtual_nodes: usize,
    pub load: f64,
}

/// Consistent hashing with bounded loads.
///
/// Not synchronized; `HashRing` owns it behind a lock.
#[derive(Debug, Clone)]
pub struct ConsistentHash {
    params: RingParams,
    /// Member name to its placement load.
    members: BTreeMap<String, usize>,
    /// Virtual points sorted by `(hash, member)`, so equal hashes of different members
    /// both stay on the ring.
    points: Vec<(u64, String)>,
    /// Placement owner of each partition; empty when there are no members.
    partitions: Vec<String>,
}

impl ConsistentHash {
    pub fn new(params: RingParams) -> Self {
        Self {
            params,
            members: BTreeMap::new(),
            points: Vec::new(),
            partitions: Vec::new(),
        }
    }

    pub fn params(&self) -> RingParams {
        self.params
    }

    pub fn members(&self) -> Vec<String> {
        self.members.keys().cloned().collect()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, member: &str) -> bool {
        self.members.contains_key(member)
    }

    /// Returns false when the member was already present.
    pub fn add(&mut self, member: &str) -> bool {
        if self.members.contains_key(member) {
            return false;
        }
        for i in 0..self.params.virtual_nodes {
            let point = hash(format!("{}{}", member, i).as_bytes());
            self.points.push((point, member.to_string()));
        }
        self.points.sort_unstable();
        self.members.insert(member.to_string(), 0);
        self.distribute();
        true
    }

    /// Returns false when the member was not present.
    pub fn remove(&mut self, member: &str) -> bool {
        if self.members.remove(member).is_none() {
            return false;
        }
        self.points.retain(|(_, owner)| owner != member);
        self.distribute();
        true
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    /// Maximum number of partitions a single member may be assigned.
    pub fn average_load(&self) -> usize {
        if self.members.is_empty() {
            return 0;
        }
        let avg = self.params.partition_count as f64 / self.members.len() as f64;
        (avg * self.params.load).ceil() as usize
    }

    fn distribute(&mut self) {
        for load in self.members.values_mut() {
            *load = 0;
        }
        self.partitions.clear();
        if self.members.is_empty() {
            return;
        }

        let cap = self.average_load();
        for partition in 0..self.params.partition_count {
            let key = hash(&(partition as u64).to_le_bytes());
            let mut idx = self.points.partition_point(|(point, _)| *point < key);
            if idx >= self.points.len() {
                idx = 0;
            }
            // With load >= 1 the caps add up to at least partition_count, so a lap
            // around the ring always finds room.
            for _ in 0..self.points.len() {
                let owner = &self.points[idx].1;
                if let Some(load) = self.members.get_mut(owner)
                    && *load < cap
                {
                    *load += 1;
                    self.partitions.push(owner.clone());
                    break;
                }
                idx = (idx + 1) % self.points.len();
            }
        }
    }

    pub fn find_partition_id(&self, key: &[u8]) -> u32 {
        (hash(key) % self.params.partition_count as u64) as u32
    }

    pub fn partition_owner(&self, partition: u32) -> Result<&str> {
        if self.members.is_empty() {
            return Err(ClusterError::NoMembers);
        }
        self.partitions
            .get(partition as usize)
            .map(String::as_str)
            .ok_or_else(|| {
                ClusterError::Invariant(format!(
                    "partition {} outside [0, {})",
                    partition, self.params.partition_count
                ))
            })
    }

    /// Up to `count` distinct members for `partition`, placement owner first, then the
    /// following members in name-hash order.
    pub fn closest_n_for_partition(&self, partition: u32, count: usize) -> Result<Vec<String>> {
        let owner = self.partition_owner(partition)?;

        let mut keyed: Vec<(u64, &str)> = self
            .members
            .keys()
            .map(|name| (hash(name.as_bytes()), name.as_str()))
            .collect();
        keyed.sort_unstable();

        let count = count.min(keyed.len());
        let start = keyed
            .iter()
            .position(|(_, name)| *name == owner)
            .unwrap_or(0);

        Ok((0..count)
            .map(|offset| keyed[(start + offset) % keyed.len()].1.to_string())
            .collect())
    }

    pub fn closest_n(&self, key: &[u8], count: usize) -> Result<Vec<String>> {
        self.closest_n_for_partition(self.find_partition_id(key), count)
    }

    pub fn load_distribution(&self) -> BTreeMap<String, usize> {
        self.members.clone()
    }
}
