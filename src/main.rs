use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use sudoku_p2p::{config::NodeConfig, node::NodeState, web};

#[tokio::main]
async fn main() -> Result<()> {
    let json_logs = std::env::var("SUDOKU_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("sudoku_p2p=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = NodeConfig::parse();
    let node = NodeState::new(&config);

    let p2p_listener = TcpListener::bind(("0.0.0.0", config.service)).await?;
    tracing::info!(port = config.service, "P2P listener bound");
    node.start(p2p_listener).await?;

    if let Some(parent) = &node.parent {
        tracing::info!(parent = %parent, "bootstrapping via parent");
    } else {
        tracing::info!("starting as the first node in the overlay");
    }

    let http_listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!(port = config.port, "HTTP listener bound");

    let app = web::router(node);
    axum::serve(http_listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
