//! Tunely agent binary.
//!
//! Dials out to a broker, authenticates with a tunnel token, and relays the
//! broker's requests to a local HTTP target.

mod backoff;
mod config;
mod executor;
mod target;
mod tunnel;

use anyhow::Result;
use clap::Parser;
use config::ClientConfig;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ClientConfig::parse();

    let _ = FmtSubscriber::builder()
        .with_max_level(if config.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(false)
        .try_init();

    info!("Starting tunely-client v{}", env!("CARGO_PKG_VERSION"));
    info!("Server: {}", config.server_url);
    info!("Target: {}", config.target_url);

    tunnel::run(config).await
}
