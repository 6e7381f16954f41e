//! Tunely broker binary.
//!
//! Serves the agent control channel, the public forward endpoint and the
//! admin API from a single listener.

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use tunely_server::config::ServerConfig;
use tunely_server::server::{self, AppState};
use tunely_server::store::TunnelStore;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();

    let _ = FmtSubscriber::builder()
        .with_max_level(if config.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(false)
        .try_init();

    info!("Starting tunely-server v{}", env!("CARGO_PKG_VERSION"));
    info!("Listen address: {}", config.listen_addr);
    info!("Control path: {}", config.control_path);

    if config.admin_api_key.is_some() {
        info!("Admin API authentication enabled");
    } else {
        warn!("Admin API authentication disabled - management endpoints are unprotected!");
    }

    let store = TunnelStore::connect(config.database_url.as_deref()).await?;
    let listen_addr = config.listen_addr.clone();
    let state = AppState::new(config, store);
    let app = server::build_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    info!("Server is ready to accept connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received, draining connections...");
    }
}
