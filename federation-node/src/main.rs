//! Federation node binary.

use anyhow::Context;
use clap::Parser;
use federation_cluster::{FederationNode, HttpTransport, NodeId, PeerTransport};
use federation_node::{init_tracing, router, AppState, CommandExecutor, ConfigLoader, LoggingExecutor};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tracing::info;

/// Runtime federation node
#[derive(Debug, Parser)]
#[command(name = "federation-node", version, about)]
struct Cli {
    /// Configuration file; searched for when omitted
    #[arg(short, long, env = "FEDERATION_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured node id
    #[arg(long)]
    node_id: Option<String>,

    /// Override the API bind address
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs)?;

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_file(path);
    }
    let mut config = loader.load().context("failed to load configuration")?;
    if let Some(node_id) = cli.node_id {
        config.node_id = NodeId::new(node_id);
    }
    if let Some(bind) = cli.bind {
        config.api.bind_address = bind;
    }
    config.validate_config().context("invalid configuration after CLI overrides")?;
    let seal = loader.cluster_seal().context("cluster seal is required")?;

    let transport = HttpTransport::new(config.cluster_root.clone(), config.timing.send_timeout())
        .context("failed to build peer transport")?;
    let bind_address = config.api.bind_address;
    let node = Arc::new(FederationNode::new(
        config,
        seal.as_bytes(),
        Arc::new(transport) as Arc<dyn PeerTransport>,
    )?);
    node.start();

    let executor: Arc<dyn CommandExecutor> = Arc::new(LoggingExecutor::new());
    let app = router(AppState { node: Arc::clone(&node), executor });

    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!(node_id = %node.node_id(), %bind_address, "Federation API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server failed")?;

    node.stop().await;
    info!("Federation node shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
