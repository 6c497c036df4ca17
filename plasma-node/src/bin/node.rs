//! Plasma child chain node binary
//!
//! Usage: `plasma-node [config.toml]`. `PLASMA_*` environment variables
//! override the file. Without a contract address the node runs against an
//! in-memory root chain.

use anyhow::Context;
use plasma_node::root_chain::{EthRootChain, MockRootChain, RootChain};
use plasma_node::{Config, Node};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting Plasma node");

    // Load configuration
    let mut config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path).with_context(|| format!("loading {}", path))?,
        None => Config::default(),
    };
    config.apply_env().context("applying environment overrides")?;

    let root_chain: Arc<dyn RootChain> = if config.root_chain.contract_address.is_empty() {
        tracing::warn!("No root chain contract configured, using in-memory root chain");
        Arc::new(MockRootChain::new())
    } else {
        Arc::new(EthRootChain::new(&config.root_chain).context("connecting to root chain")?)
    };

    let node = Node::open(config, root_chain)
        .await
        .context("opening node")?;
    node.start().await.context("starting node")?;

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down Plasma node");
    node.stop().await?;
    Ok(())
}
