// reach-node entry point

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use reach_store::config::{ConfigError, NodeConfig};
use reach_store::node::Node;
use reach_store::sovereignty::SovereigntyMode;

/// Reach-gated storage node
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to a YAML configuration file; otherwise REACH_* variables are used
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,

    /// Node ID
    #[clap(short, long)]
    node_id: Option<String>,

    /// Listen address
    #[clap(short, long)]
    listen_addr: Option<String>,

    /// Storage root directory
    #[clap(long)]
    storage_root: Option<PathBuf>,

    /// Sovereignty mode: laptop, home_node, home_cluster or network
    #[clap(long)]
    sovereignty: Option<String>,

    /// Log filter, overriding the configured level
    #[clap(long)]
    log_level: Option<String>,

    /// Shorthand for --log-level debug
    #[clap(short, long)]
    verbose: bool,
}

fn load_config(args: &Args) -> Result<NodeConfig> {
    let mut config = match &args.config {
        Some(path) => NodeConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => match (NodeConfig::from_env(), &args.node_id) {
            (Ok(config), _) => config,
            (Err(ConfigError::Missing(_)), Some(node_id)) => NodeConfig::new(node_id.clone()),
            (Err(e), _) => return Err(e).context("Failed to load configuration from environment"),
        },
    };

    if let Some(node_id) = &args.node_id {
        config.node_id = node_id.clone();
    }
    if let Some(addr) = &args.listen_addr {
        config.listen_addr = addr.clone();
    }
    if let Some(root) = &args.storage_root {
        config.storage_root = root.clone();
    }
    if let Some(mode) = &args.sovereignty {
        config.sovereignty = serde_yaml::from_str::<SovereigntyMode>(mode)
            .with_context(|| format!("Unknown sovereignty mode {}", mode))?;
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    if args.verbose {
        config.log_level = "debug".to_string();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting reach node {}...", config.node_id);
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.listen_addr))?;

    let node = Node::open(config)
        .await
        .context("Failed to open node")?;
    node.start().await;

    info!("Listening on {}, press Ctrl+C to exit", addr);
    let server = axum::Server::bind(&addr)
        .serve(node.router().into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Error waiting for shutdown signal: {}", e);
            }
            info!("Shutting down reach node...");
        });

    if let Err(e) = server.await {
        error!("HTTP server failed: {}", e);
    }

    node.shutdown().await;
    info!("Node shutdown complete");
    Ok(())
}
