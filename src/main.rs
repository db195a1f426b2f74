use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use fufile_coord::config::{NodeConfig, TimerConfig};
use fufile_coord::network::MemoryNetwork;
use fufile_coord::node::{Node, NodeHandle, NodeStatus};
use fufile_coord::shutdown::install_shutdown_handler;

const BASE_PORT: u16 = 9090;
const MAX_NODES: u16 = 1000;

#[derive(Parser, Debug)]
#[command(name = "fufile-coord")]
#[command(version)]
#[command(about = "Cluster coordination core: timer wheel, peer liveness and leader election")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run an in-process cluster over the memory network
    Simulate(SimulateArgs),

    /// Validate timer and timeout settings
    CheckConfig(TimingArgs),
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug, Clone)]
struct TimingArgs {
    /// Interval between heartbeats, in milliseconds
    #[arg(long, default_value = "2000")]
    heartbeat_interval_ms: u64,

    /// Peer is dropped after this long without heartbeats
    #[arg(long, default_value = "10000")]
    heartbeat_timeout_ms: u64,

    /// Lower bound of the randomized election timeout
    #[arg(long, default_value = "10000")]
    election_timeout_min_ms: u64,

    /// Upper bound of the randomized election timeout
    #[arg(long, default_value = "20000")]
    election_timeout_max_ms: u64,

    /// Timer wheel tick
    #[arg(long, default_value = "10")]
    tick_ms: u64,

    /// Buckets in the near wheel
    #[arg(long, default_value = "60")]
    near_buckets: usize,

    /// Buckets in the far wheel
    #[arg(long, default_value = "100")]
    far_buckets: usize,
}

impl TimingArgs {
    fn apply(&self, config: NodeConfig) -> NodeConfig {
        NodeConfig {
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            heartbeat_timeout_ms: self.heartbeat_timeout_ms,
            election_timeout_min_ms: self.election_timeout_min_ms,
            election_timeout_max_ms: self.election_timeout_max_ms,
            timer: TimerConfig {
                tick_ms: self.tick_ms,
                near_buckets: self.near_buckets,
                far_buckets: self.far_buckets,
            },
            ..config
        }
    }
}

#[derive(Parser, Debug)]
struct SimulateArgs {
    /// Number of nodes in the cluster
    #[arg(long, default_value = "3", value_parser = clap::value_parser!(u16).range(1..=MAX_NODES as i64))]
    nodes: u16,

    /// How long to run before printing the final status
    #[arg(long, default_value = "30")]
    duration_secs: u64,

    /// Cut the current leader off the network after this many seconds
    #[arg(long)]
    isolate_leader_after_secs: Option<u64>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    #[command(flatten)]
    timing: TimingArgs,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Simulation
// =============================================================================

fn cluster_configs(count: u16, timing: &TimingArgs) -> Vec<NodeConfig> {
    let count = count.min(MAX_NODES);
    (1..=count)
        .map(|id| {
            let mut config = NodeConfig::new(id.to_string(), "memory", BASE_PORT + id);
            for peer in (1..=count).filter(|p| *p != id) {
                config = config.with_peer(peer.to_string(), "memory", BASE_PORT + peer);
            }
            timing.apply(config)
        })
        .collect()
}

#[derive(Serialize)]
struct SimulationReport {
    isolated: Option<String>,
    nodes: Vec<NodeStatus>,
}

async fn run_simulation(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler()?;
    let network = MemoryNetwork::new();

    let mut handles: Vec<NodeHandle> = Vec::with_capacity(args.nodes as usize);
    for config in cluster_configs(args.nodes, &args.timing) {
        let node = Node::in_memory(config, &network);
        handles.push(node.start(shutdown.child_token())?);
    }
    tracing::info!(nodes = args.nodes, duration_secs = args.duration_secs, "Simulation started");

    let duration = Duration::from_secs(args.duration_secs);
    let mut isolated = None;
    let isolate_at = args
        .isolate_leader_after_secs
        .map(Duration::from_secs)
        .filter(|at| *at < duration);

    let started = tokio::time::Instant::now();
    if let Some(at) = isolate_at {
        tokio::select! {
            _ = tokio::time::sleep(at) => {
                match handles.iter().find(|h| h.is_leader()) {
                    Some(leader) => {
                        tracing::info!(node_id = leader.node_id(), "Isolating leader");
                        network.isolate(leader.node_id());
                        isolated = Some(leader.node_id().to_string());
                    }
                    None => tracing::warn!("No leader to isolate"),
                }
            }
            _ = shutdown.cancelled() => {}
        }
    }

    let remaining = duration.saturating_sub(started.elapsed());
    tokio::select! {
        _ = tokio::time::sleep(remaining) => {}
        _ = shutdown.cancelled() => {}
    }

    let report = SimulationReport {
        isolated,
        nodes: handles.iter().map(|h| h.status()).collect(),
    };
    shutdown.cancel();
    for handle in handles {
        let node_id = handle.node_id().to_string();
        if let Err(e) = handle.join().await {
            tracing::error!(node_id = %node_id, error = %e, "Node stopped with error");
        }
    }

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Table => print_report(&report),
    }
    Ok(())
}

fn print_report(report: &SimulationReport) {
    println!("Cluster Status");
    println!("{}", "=".repeat(72));
    if let Some(isolated) = &report.isolated {
        println!("Isolated: Node {}", isolated);
        println!();
    }
    println!(
        "{:<8} {:<10} {:<6} {:<8} {:<10} PEERS",
        "ID", "ROLE", "TERM", "LEADER", "VOTED"
    );
    println!("{}", "-".repeat(72));
    for status in &report.nodes {
        println!(
            "{:<8} {:<10} {:<6} {:<8} {:<10} {}",
            status.node_id,
            status.role.to_string(),
            status.term,
            status.leader_id.as_deref().unwrap_or("-"),
            status.voted_for.as_deref().unwrap_or("-"),
            status.connected_peers.join(",")
        );
    }
}

// =============================================================================
// Config check
// =============================================================================

fn check_config(args: TimingArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.apply(NodeConfig::default());
    config.validate()?;
    println!("Configuration OK");
    println!("Tick:            {}ms", config.timer.tick_ms);
    println!("Near wheel span: {}ms", config.timer.near_span_ms());
    println!("Wheel capacity:  {}ms", config.timer.capacity_ms());
    println!("Longest delay:   {}ms", config.timer.max_delay_ms());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Simulate(simulate_args) => {
            run_simulation(simulate_args).await?;
        }
        Commands::CheckConfig(timing) => {
            check_config(timing)?;
        }
    }

    Ok(())
}
