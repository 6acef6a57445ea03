//! Ballast demo - an in-process cluster driven from the command line.
//!
//! Spins up N nodes over the in-process router, waits for a leader, pushes
//! a batch of key/value traffic through the replicated log, and verifies
//! that every node converged on the same state.

use ballast::config::NodeConfig;
use ballast::kv::{KvClient, KvService};
use ballast::raft::{LocalRouter, MemPersister, Persister, RaftNode, RocksPersister};
use ballast::types::NodeId;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ballast", about = "Replicated key/value store demo cluster")]
struct Cli {
    /// Number of nodes in the cluster.
    #[arg(long, default_value_t = 3)]
    nodes: usize,

    /// Number of put/append operations to drive through the log.
    #[arg(long, default_value_t = 20)]
    ops: usize,

    /// Directory for durable state; omit to keep everything in memory.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Persisted-state size (bytes) that triggers a snapshot; 0 disables.
    #[arg(long, default_value_t = 0)]
    snapshot_threshold: usize,

    /// Log filter, e.g. "info" or "ballast=debug".
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    let ids: Vec<NodeId> = (1..=cli.nodes as NodeId).collect();
    let router = LocalRouter::new();
    let mut services = Vec::new();

    for &id in &ids {
        let config = NodeConfig {
            node_id: id,
            peers: ids.iter().copied().filter(|&p| p != id).collect(),
            data_dir: cli.data_dir.clone().unwrap_or_default(),
            snapshot_threshold: cli.snapshot_threshold,
            log_level: cli.log_level.clone(),
            ..Default::default()
        };
        config.validate()?;

        let persister: Arc<dyn Persister> = match &cli.data_dir {
            Some(dir) => Arc::new(RocksPersister::open(dir.join(format!("node-{}", id)))?),
            None => Arc::new(MemPersister::new()),
        };

        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let raft = RaftNode::new(
            config.raft.clone(),
            id,
            config.peers.clone(),
            router.handle(id),
            Arc::clone(&persister),
            apply_tx,
        )?;
        router.register(id, Arc::clone(&raft));
        raft.run();

        let service = KvService::new(raft, persister, config.snapshot_threshold);
        service.run(apply_rx);
        services.push(service);
    }

    // Let the first election settle.
    let leader = loop {
        if let Some(service) = services.iter().find(|s| s.raft().get_state().1) {
            break service.raft();
        }
        sleep(Duration::from_millis(50)).await;
    };
    let (term, _) = leader.get_state();
    info!(term, "cluster elected a leader");

    let client = KvClient::new(services.clone(), 1);
    for i in 0..cli.ops {
        let key = format!("key-{}", i % 5);
        client.append(&key, &format!("[{}]", i)).await?;
    }
    info!(ops = cli.ops, "all operations committed");

    // Reads go through the log too, so they reflect every prior write.
    for i in 0..5.min(cli.ops) {
        let key = format!("key-{}", i);
        let value = client.get(&key).await?;
        println!("{} = {}", key, value.unwrap_or_default());
    }

    // Give replication a moment, then check convergence across nodes.
    sleep(Duration::from_millis(500)).await;
    let reference = services[0].local_get("key-0");
    for service in &services[1..] {
        anyhow::ensure!(
            service.local_get("key-0") == reference,
            "nodes diverged on key-0"
        );
    }
    info!(nodes = services.len(), "all nodes converged");

    for service in &services {
        service.raft().kill();
    }
    Ok(())
}
