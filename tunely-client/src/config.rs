//! Agent configuration.

use std::time::Duration;

use clap::Parser;

/// Tunely agent - expose a local HTTP service through a Tunely broker.
#[derive(Parser, Debug, Clone)]
#[command(name = "tunely-client")]
#[command(author, version, about, long_about = None)]
pub struct ClientConfig {
    /// Broker WebSocket URL
    #[arg(
        short,
        long,
        env = "TUNELY_SERVER_URL",
        default_value = "ws://localhost:8000/ws/tunnel"
    )]
    pub server_url: String,

    /// Tunnel token issued when the domain was created
    #[arg(short, long, env = "TUNELY_TOKEN")]
    pub token: String,

    /// Local target the relayed requests are performed against
    #[arg(
        long,
        env = "TUNELY_TARGET_URL",
        default_value = "http://127.0.0.1:8080"
    )]
    pub target_url: String,

    /// Preempt an existing connection for this domain
    #[arg(long, env = "TUNELY_FORCE")]
    pub force: bool,

    /// Default per-request timeout in seconds
    #[arg(long, env = "TUNELY_REQUEST_TIMEOUT", default_value = "300")]
    pub request_timeout_s: u64,

    /// Reconnect backoff base in seconds
    #[arg(long, env = "TUNELY_RECONNECT_BASE", default_value = "5")]
    pub reconnect_base_s: u64,

    /// Reconnect backoff ceiling in seconds
    #[arg(long, env = "TUNELY_RECONNECT_MAX", default_value = "300")]
    pub reconnect_max_s: u64,

    /// Cap on the backoff doubling exponent
    #[arg(long, env = "TUNELY_RECONNECT_FACTOR_CAP", default_value = "8")]
    pub reconnect_factor_cap: u32,

    /// Maximum control-channel frame size in bytes
    #[arg(long, env = "TUNELY_MAX_FRAME_BYTES", default_value = "8388608")]
    pub max_frame_bytes: usize,

    /// Enable debug logging
    #[arg(long, env = "TUNELY_DEBUG")]
    pub debug: bool,
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_s)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_secs(self.reconnect_base_s)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_s)
    }
}
