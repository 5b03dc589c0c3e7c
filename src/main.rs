use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use epoch_kv::config::ClusterConfig;
use epoch_kv::membership::service::MembershipService;
use epoch_kv::membership::types::MemberInfo;
use epoch_kv::node::node::Node;
use epoch_kv::storage::engine::MemoryStorage;
use epoch_kv::transport::client::HttpConnector;
use epoch_kv::transport::handlers::router;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "epoch-kv", about = "Replicated key-value node")]
struct NodeArgs {
    /// Member name on the ring. Defaults to a random UUID.
    #[arg(long, env = "EPOCH_KV_NAME")]
    name: Option<String>,

    /// UDP gossip address.
    #[arg(long)]
    bind: SocketAddr,

    /// HTTP address. Defaults to the gossip port + 1000; required when that overflows.
    #[arg(long)]
    http: Option<SocketAddr>,

    /// Gossip address of an existing member. May be repeated.
    #[arg(long = "seed")]
    seeds: Vec<SocketAddr>,

    #[arg(long, env = "EPOCH_KV_PARTITIONS", default_value_t = 271)]
    partitions: u32,

    #[arg(long, env = "EPOCH_KV_REPLICAS", default_value_t = 3)]
    replicas: usize,

    #[arg(long, env = "EPOCH_KV_BUCKETS", default_value_t = 64)]
    buckets: u32,

    #[arg(long, env = "EPOCH_KV_WRITE_QUORUM", default_value_t = 2)]
    write_quorum: usize,

    #[arg(long, env = "EPOCH_KV_READ_QUORUM", default_value_t = 2)]
    read_quorum: usize,

    #[arg(long, env = "EPOCH_KV_EPOCH_INTERVAL_MS", default_value_t = 10_000)]
    epoch_interval_ms: u64,

    #[arg(long, env = "EPOCH_KV_TIMEOUT_MS", default_value_t = 2_000)]
    timeout_ms: u64,

    #[arg(long, env = "EPOCH_KV_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Quiet period before ring mutations are folded into a new placement.
    #[arg(long, env = "EPOCH_KV_RING_DEBOUNCE_MS", default_value_t = 1_000)]
    ring_debounce_ms: u64,

    /// Placement load factor, at least 1.0.
    #[arg(long, env = "EPOCH_KV_LOAD", default_value_t = 1.25)]
    load: f64,

    #[arg(long, env = "EPOCH_KV_VIRTUAL_NODES", default_value_t = 20)]
    virtual_nodes: usize,

    /// Decimal digits of the epoch in index keys.
    #[arg(long, env = "EPOCH_KV_EPOCH_PAD_WIDTH", default_value_t = 10)]
    epoch_pad_width: usize,

    /// Never self-elect. Some other member has to bootstrap the epoch log.
    #[arg(long, default_value_t = false)]
    no_bootstrap: bool,
}

impl NodeArgs {
    fn config(&self) -> ClusterConfig {
        let name = self
            .name
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let defaults = ClusterConfig::default();

        ClusterConfig::new(name)
            .with_partition_count(self.partitions)
            .with_replica_count(self.replicas)
            .with_partition_buckets(self.buckets)
            .with_quorums(self.write_quorum, self.read_quorum)
            .with_epoch_interval(Duration::from_millis(self.epoch_interval_ms))
            .with_default_timeout(Duration::from_millis(self.timeout_ms))
            .with_workers(self.workers)
            .with_ring_debounce(Duration::from_millis(self.ring_debounce_ms))
            .with_load(self.load)
            .with_virtual_nodes(self.virtual_nodes)
            .with_epoch_pad_width(self.epoch_pad_width)
            .with_auto_bootstrap(!self.no_bootstrap, defaults.bootstrap_timeout)
    }

    fn http_addr(&self) -> anyhow::Result<SocketAddr> {
        match self.http {
            Some(addr) => Ok(addr),
            None => default_http_addr(self.bind).with_context(|| {
                format!("gossip port {} has no port + 1000, pass --http", self.bind.port())
            }),
        }
    }
}

fn default_http_addr(bind: SocketAddr) -> Option<SocketAddr> {
    let port = bind.port().checked_add(1000)?;
    Some(SocketAddr::new(bind.ip(), port))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hyper=warn,reqwest=warn".into()),
        )
        .init();

    let args = NodeArgs::parse();
    let config = args.config();
    let http_addr = args.http_addr()?;

    tracing::info!("Starting node {} on {}", config.node_name, args.bind);
    if args.seeds.is_empty() {
        tracing::info!("No seeds given, waiting for members to join");
    } else {
        tracing::info!("Seed nodes: {:?}", args.seeds);
    }

    // 1. Node (storage, ring, epoch clock, controller):
    let connector = Arc::new(HttpConnector::new(config.default_timeout));
    let local = MemberInfo::new(config.node_name.clone(), args.bind, http_addr);
    let node = Node::start(config, Arc::new(MemoryStorage::new()), connector)?;

    // 2. Membership (UDP gossip):
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let membership = MembershipService::new(local, args.seeds.clone(), events_tx).await?;
    node.attach_membership(events_rx);
    let mut background = membership.start(node.shutdown_signal());

    // 3. Stats reporter:
    let reporter_node = Arc::clone(&node);
    let reporter_membership = Arc::clone(&membership);
    let mut reporter_shutdown = node.shutdown_signal().subscribe();
    background.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = reporter_shutdown.recv() => break,
            }
            let health = reporter_node.health();
            tracing::info!(
                "Cluster stats: {} alive, epoch {} ({:?}), {} active partitions, {} queued",
                reporter_membership.get_alive_members().len(),
                health.epoch,
                health.apply_state,
                health.active_partitions,
                health.queued_work
            );
        }
    }));

    // 4. HTTP server:
    tracing::info!("HTTP server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, router(node.sender().clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await?;

    node.shutdown().await?;
    for task in background {
        let _ = task.await;
    }
    Ok(())
}
