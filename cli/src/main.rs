use std::{path::PathBuf, process, time::Duration};

use clap::Parser;
use futures::future::join_all;
use tracing::{error, info};
use vigil::service::{
    in_memory_neighbors, DirStore, MemoryStore, NodeConfig, NodeId, Shutdown, SnapshotStore,
    Supervisor,
};

mod demo;
mod topology;

use topology::{Preset, Topology};

/// Runs a whole cluster of nodes in this process, linked by in-memory
/// channels, and exits once the coordinator detects termination.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Number of nodes
    #[arg(short, long, default_value_t = 4)]
    nodes: usize,
    /// Topology preset
    #[arg(short, long, value_enum, default_value_t = Preset::Line)]
    topology: Preset,
    /// Explicit edges, e.g. `0-1,1-2,2-0`. Overrides the preset.
    #[arg(short, long)]
    edges: Option<String>,
    /// Delay between snapshot rounds, in milliseconds
    #[arg(short, long, default_value_t = 1000)]
    delay_ms: u64,
    /// Application messages each node sends before going quiet
    #[arg(short, long, default_value_t = 5)]
    messages: usize,
    /// Keep snapshot records in this directory instead of memory
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let topology = match &args.edges {
        Some(list) => match Topology::parse_edges(list) {
            Ok(edges) => Topology::from_edges(args.nodes, &edges),
            Err(e) => {
                error!("{}", e);
                process::exit(2);
            }
        },
        None => Topology::preset(args.topology, args.nodes),
    };
    if let Err(e) = topology.check() {
        error!("{}", e);
        process::exit(2);
    }

    let delay = Duration::from_millis(args.delay_ms);
    let edges = topology.edges();
    let mut services = Vec::new();
    let mut apps = Vec::new();

    for (id, neighbors) in in_memory_neighbors(args.nodes, &edges, 64 * 1024)
        .into_iter()
        .enumerate()
    {
        let id = id as NodeId;
        let neighbor_ids: Vec<NodeId> = neighbors.iter().map(|n| n.id).collect();
        let config = NodeConfig::builder()
            .id(id)
            .node_count(args.nodes)
            .neighbors(neighbors)
            .snapshot_delay(delay)
            .build();
        let store: Box<dyn SnapshotStore> = match &args.snapshot_dir {
            Some(dir) => match DirStore::new(dir) {
                Ok(store) => Box::new(store),
                Err(e) => {
                    error!("can't use {}: {}", dir.display(), e);
                    process::exit(1);
                }
            },
            None => Box::new(MemoryStore::new()),
        };

        let (handle, port) = match Supervisor::new().start(config, store) {
            Ok(started) => started,
            Err(e) => {
                error!("node {} failed to start: {}", id, e);
                process::exit(1);
            }
        };
        services.push(handle.join());
        apps.push(tokio::spawn(demo::run(
            id,
            neighbor_ids,
            args.messages,
            delay / 4,
            port,
        )));
    }

    let mut terminated = true;
    for (id, result) in join_all(services).await.into_iter().enumerate() {
        match result {
            Ok(Shutdown::Terminated { seq }) => info!("node {} terminated ({})", id, seq),
            Err(e) => {
                error!("node {} failed: {}", id, e);
                terminated = false;
            }
        }
    }
    let delivered: usize = join_all(apps)
        .await
        .into_iter()
        .map(|d| d.unwrap_or(0))
        .sum();
    info!("{} application messages delivered", delivered);

    process::exit(if terminated { 0 } else { 1 });
}
