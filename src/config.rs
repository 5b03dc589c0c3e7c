use std::time::Duration;

use crate::error::{ClusterError, Result};

/// Cluster-wide tunables. Fixed at process start and shared by every component.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// This node's member name on the ring.
    pub node_name: String,

    /// Fixed number of partitions for the lifetime of the cluster (default: 271)
    pub partition_count: u32,

    /// Virtual points each member places on the ring (default: 20)
    pub virtual_nodes: usize,

    /// Bounded-load factor; a member may own at most `ceil(avg * load)` partitions (default: 1.25)
    pub load: f64,

    /// Owners per partition (default: 3)
    pub replica_count: usize,

    /// Merkle buckets per partition (default: 64)
    pub partition_buckets: u32,

    pub write_quorum: usize,
    pub read_quorum: usize,

    /// Quiet period before queued ring mutations are applied (default: 1s)
    pub ring_debounce: Duration,

    /// Deadline for RPCs and request-channel hand-offs (default: 2s)
    pub default_timeout: Duration,

    /// How often the leader advances the epoch (default: 10s)
    pub epoch_interval: Duration,

    pub auto_bootstrap: bool,
    pub bootstrap_timeout: Duration,

    /// Consistency workers popping the sync/verify queue (default: 4)
    pub workers: usize,

    pub request_channel_size: usize,

    /// Decimal digits used for the epoch column of index keys (default: 10)
    pub epoch_pad_width: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_name: uuid::Uuid::new_v4().to_string(),
            partition_count: 271,
            virtual_nodes: 20,
            load: 1.25,
            replica_count: 3,
            partition_buckets: 64,
            write_quorum: 2,
            read_quorum: 2,
            ring_debounce: Duration::from_secs(1),
            default_timeout: Duration::from_secs(2),
            epoch_interval: Duration::from_secs(10),
            auto_bootstrap: true,
            bootstrap_timeout: Duration::from_secs(5),
            workers: 4,
            request_channel_size: 1024,
            epoch_pad_width: 10,
        }
    }
}

impl ClusterConfig {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            ..Default::default()
        }
    }

    pub fn with_partition_count(mut self, partition_count: u32) -> Self {
        self.partition_count = partition_count;
        self
    }

    pub fn with_partition_buckets(mut self, partition_buckets: u32) -> Self {
        self.partition_buckets = partition_buckets;
        self
    }

    /// Sets the replica count and clamps both quorums to it.
    pub fn with_replica_count(mut self, replica_count: usize) -> Self {
        self.replica_count = replica_count;
        self.write_quorum = self.write_quorum.min(replica_count);
        self.read_quorum = self.read_quorum.min(replica_count);
        self
    }

    pub fn with_quorums(mut self, write_quorum: usize, read_quorum: usize) -> Self {
        self.write_quorum = write_quorum;
        self.read_quorum = read_quorum;
        self
    }

    pub fn with_ring_debounce(mut self, ring_debounce: Duration) -> Self {
        self.ring_debounce = ring_debounce;
        self
    }

    pub fn with_virtual_nodes(mut self, virtual_nodes: usize) -> Self {
        self.virtual_nodes = virtual_nodes;
        self
    }

    /// Placement load factor; each member takes at most `ceil(partitions / members * load)`.
    pub fn with_load(mut self, load: f64) -> Self {
        self.load = load;
        self
    }

    pub fn with_epoch_pad_width(mut self, epoch_pad_width: usize) -> Self {
        self.epoch_pad_width = epoch_pad_width;
        self
    }

    pub fn with_default_timeout(mut self, default_timeout: Duration) -> Self {
        self.default_timeout = default_timeout;
        self
    }

    pub fn with_epoch_interval(mut self, epoch_interval: Duration) -> Self {
        self.epoch_interval = epoch_interval;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_auto_bootstrap(mut self, auto_bootstrap: bool, timeout: Duration) -> Self {
        self.auto_bootstrap = auto_bootstrap;
        self.bootstrap_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(ClusterError::Config("node name must not be empty".into()));
        }
        if self.partition_count == 0 {
            return Err(ClusterError::Config("partition_count must be > 0".into()));
        }
        if self.partition_buckets == 0 {
            return Err(ClusterError::Config("partition_buckets must be > 0".into()));
        }
        if self.virtual_nodes == 0 {
            return Err(ClusterError::Config("virtual_nodes must be > 0".into()));
        }
        if !(self.load >= 1.0) {
            return Err(ClusterError::Config(format!(
                "load must be >= 1.0, got {}",
                self.load
            )));
        }
        if self.replica_count == 0 {
            return Err(ClusterError::Config("replica_count must be > 0".into()));
        }
        if self.write_quorum == 0 || self.write_quorum > self.replica_count {
            return Err(ClusterError::Config(format!(
                "write_quorum {} must be within 1..={}",
                self.write_quorum, self.replica_count
            )));
        }
        if self.read_quorum == 0 || self.read_quorum > self.replica_count {
            return Err(ClusterError::Config(format!(
                "read_quorum {} must be within 1..={}",
                self.read_quorum, self.replica_count
            )));
        }
        if self.workers == 0 {
            return Err(ClusterError::Config("workers must be > 0".into()));
        }
        if self.epoch_pad_width == 0 || self.epoch_pad_width > 18 {
            return Err(ClusterError::Config(
                "epoch_pad_width must be within 1..=18".into(),
            ));
        }
        Ok(())
    }
}
