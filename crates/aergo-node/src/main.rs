//! Aergo P2P node.
//!
//! Runs the P2P layer over an in-memory relay chain and mempool.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod config;
mod node;

use config::NodeConfig;
use node::Node;

/// Aergo peer-to-peer relay node.
#[derive(Parser, Debug)]
#[command(name = "aergo-node")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "aergo-node.toml")]
    config: PathBuf,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Advertised P2P port
    #[arg(long)]
    p2p_port: Option<u16>,

    /// Designated peer as a multiaddr, may be repeated
    #[arg(long)]
    add_peer: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Aergo P2P node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::load(&args.config, &args)?;
    info!(
        addr = %config.p2p.advertised_addr(),
        bind = %config.p2p.bind_addr(),
        consensus = ?config.consensus.kind,
        enable_bp = config.consensus.enable_bp,
        "Loaded configuration"
    );

    let node = Node::new(config)?;
    node.run().await?;

    info!("Aergo node stopped");
    Ok(())
}
