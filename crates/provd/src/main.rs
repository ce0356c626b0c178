//! provd — the provider daemon.
//!
//! Single binary that assembles all provider subsystems:
//! - Event bus
//! - Cluster service (inventory, hostnames, deployment managers)
//! - Bid engine
//! - Manifest service + ingestion endpoint
//! - Balance checker and withdrawal handler
//! - Chain listener
//!
//! # Usage
//!
//! ```text
//! provd standalone --listen 0.0.0.0:8443 --pricing scale --price-cpu-scale 2
//! ```

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use provd_chain::mock::MockChain;
use provd_chain::{ProviderInfo, Session};
use provd_cluster::mock::MockCluster;
use provd_cluster::Node;
use provd_types::{Attribute, ResourceUnits};

mod balance;
mod config;
mod http;
mod listener;
mod service;
mod withdraw;

use config::Config;
use service::ProviderService;

#[derive(Parser)]
#[command(name = "provd", about = "Marketplace provider daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run against in-process chain and cluster mocks (single node).
    Standalone {
        #[command(flatten)]
        config: Config,

        /// Provider address to operate as.
        #[arg(long, env = "PROVD_ADDRESS", default_value = "provider0")]
        address: String,

        /// Provider attributes, as key=value pairs.
        #[arg(long = "attribute", value_delimiter = ',')]
        attributes: Vec<String>,

        /// Mock node CPU capacity in millicores.
        #[arg(long, default_value = "16000")]
        node_cpu_millis: u64,

        /// Mock node memory capacity in GiB.
        #[arg(long, default_value = "64")]
        node_memory_gib: u64,

        /// Mock node storage capacity in GiB.
        #[arg(long, default_value = "512")]
        node_storage_gib: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,provd=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            config,
            address,
            attributes,
            node_cpu_millis,
            node_memory_gib,
            node_storage_gib,
        } => {
            let node = Node {
                name: "node0".to_string(),
                available: ResourceUnits {
                    cpu_millis: node_cpu_millis,
                    memory_bytes: node_memory_gib << 30,
                    storage_bytes: node_storage_gib << 30,
                    endpoints: 0,
                },
            };
            run_standalone(config, address, parse_attributes(&attributes)?, node).await
        }
    }
}

fn parse_attributes(pairs: &[String]) -> anyhow::Result<Vec<Attribute>> {
    pairs
        .iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("attribute {pair:?} is not key=value"))?;
            Ok(Attribute {
                key: key.to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}

async fn run_standalone(
    config: Config,
    address: String,
    attributes: Vec<Attribute>,
    node: Node,
) -> anyhow::Result<()> {
    info!("provider daemon starting in standalone mode");

    let chain = Arc::new(MockChain::new());
    let cluster = Arc::new(MockCluster::new());
    cluster.set_nodes(vec![node]);

    let session = Session::new(
        ProviderInfo {
            address,
            attributes,
        },
        chain.clone(),
        chain,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let service = ProviderService::start(session, cluster, &config, shutdown_rx).await?;

    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C handler");
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    service.join().await;
    Ok(())
}
