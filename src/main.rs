/*
    Runs a whole system of servents on a simulated network: every servent
    fires bursts of random transfers at its neighbors while one of them takes
    a snapshot of the bitcake spread across the system. Whatever is moving,
    the snapshot must account for every bitcake the system started with.
*/

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Context};
use clap::Parser;
use servent_snapshot::bitcake::BurstPlan;
use servent_snapshot::common::{Config, DeliveryMode, NodeId, SnapshotKind};
use servent_snapshot::network::Cluster;
use tokio::time::timeout;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "servent-snapshot")]
#[command(about = "Move bitcake between simulated servents and take a snapshot", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Config file path, overrides the topology flags
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of servents in a full mesh
    #[arg(long, default_value_t = 3)]
    nodes: usize,

    #[arg(long, value_enum, default_value_t = DeliveryMode::Causal)]
    delivery: DeliveryMode,

    #[arg(long, value_enum, default_value_t = SnapshotKind::AcharyaBadrinath)]
    snapshot: SnapshotKind,

    /// Transaction bursts per servent
    #[arg(long, default_value_t = 1)]
    bursts: usize,

    /// Servent that takes the snapshot
    #[arg(long, default_value_t = 0)]
    initiator: NodeId,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::clique(cli.nodes, cli.delivery, cli.snapshot),
    };
    ensure!(
        (cli.initiator as usize) < config.node_count,
        "initiator {} is not one of the {} servents",
        cli.initiator,
        config.node_count
    );
    let expected = config.initial_balance * config.node_count as i64;

    let cluster = Cluster::start(config)?;
    let initiator = cluster.servent(cli.initiator).clone();
    let mut reports = initiator.collector.subscribe();

    for round in 0..cli.bursts {
        let bursts: Vec<_> = cluster
            .servents
            .iter()
            .map(|servent| {
                let servent = servent.clone();
                tokio::spawn(async move { servent.burst(BurstPlan::default()).await })
            })
            .collect();

        if round == 0 {
            initiator.start_snapshot()?;
        }
        for burst in bursts {
            burst.await?;
        }
    }

    let report = timeout(Duration::from_secs(120), reports.wait_for(Option::is_some))
        .await
        .context("snapshot timed out")?
        .context("snapshot collector stopped")?
        .clone();
    if let Some(report) = report {
        info!(kind = ?report.kind, balances = ?report.balances, in_transit = report.in_transit, "snapshot");
        if report.kind != SnapshotKind::AlagarVenkatesan && report.total != expected {
            warn!(total = report.total, expected, "snapshot doesn't add up");
        } else {
            info!(total = report.total, "snapshot collected");
        }
    }

    if !cluster.settle(Duration::from_secs(120)).await {
        warn!("cluster didn't settle");
    }
    info!(total = cluster.total_balance(), expected, "final balance");
    cluster.shutdown().await;
    Ok(())
}
