//! metricd: the metricgrid daemon.
//!
//! # Usage
//!
//! ```text
//! metricd run --config /etc/metricgrid/metricd.toml
//! metricd check --config /etc/metricgrid/metricd.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use metricd::{Node, NodeConfig};

#[derive(Parser)]
#[command(name = "metricd", about = "metricgrid aggregation node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a node until Ctrl-C.
    Run {
        /// Path to metricd.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override `node.grpc_addr`.
        #[arg(long)]
        grpc_addr: Option<SocketAddr>,

        /// Override `node.http_addr`.
        #[arg(long)]
        http_addr: Option<SocketAddr>,
    },
    /// Validate a configuration file and exit.
    Check {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,metricd=debug,metricgrid=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            grpc_addr,
            http_addr,
        } => {
            let mut config = match config {
                Some(path) => NodeConfig::from_file(&path)?,
                None => NodeConfig::default(),
            };
            if let Some(addr) = grpc_addr {
                config.node.grpc_addr = addr;
            }
            if let Some(addr) = http_addr {
                config.node.http_addr = addr;
            }
            run(config).await
        }
        Command::Check { config } => {
            let config = NodeConfig::from_file(&config)?;
            config.validate()?;
            println!(
                "configuration ok: {} stream(s), {} peer(s)",
                config.streams.len(),
                config.cluster.peers.len()
            );
            Ok(())
        }
    }
}

async fn run(config: NodeConfig) -> anyhow::Result<()> {
    let node = Node::start(config).await?;
    info!(grpc = %node.grpc_addr(), http = %node.http_addr(), "metricd ready");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    node.stop().await?;
    Ok(())
}
