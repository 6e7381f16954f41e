//! Broker configuration.

use std::time::Duration;

use clap::Parser;

/// Tunely broker - expose private HTTP services through outbound tunnels.
#[derive(Parser, Debug, Clone)]
#[command(name = "tunely-server")]
#[command(author, version, about, long_about = None)]
pub struct ServerConfig {
    /// Address to listen on for both the control channel and the public API
    #[arg(long, env = "TUNELY_LISTEN_ADDR", default_value = "0.0.0.0:8000")]
    pub listen_addr: String,

    /// Public domain suffix reported by /api/info (e.g. tunely.example.com)
    #[arg(long, env = "TUNELY_DOMAIN", default_value = "localhost")]
    pub domain: String,

    /// WebSocket path agents connect to
    #[arg(long, env = "TUNELY_CONTROL_PATH", default_value = "/ws/tunnel")]
    pub control_path: String,

    /// Database URL (e.g. sqlite://tunely.db); memory-only when unset
    #[arg(long, env = "TUNELY_DATABASE_URL")]
    pub database_url: Option<String>,

    /// API key protecting the admin endpoints; unprotected when unset
    #[arg(long, env = "TUNELY_ADMIN_API_KEY")]
    pub admin_api_key: Option<String>,

    /// Heartbeat interval in seconds
    #[arg(long, env = "TUNELY_HEARTBEAT_INTERVAL", default_value = "30")]
    pub heartbeat_interval_s: u64,

    /// How long an agent may take to authenticate, in seconds
    #[arg(long, env = "TUNELY_AUTH_TIMEOUT", default_value = "10")]
    pub auth_timeout_s: u64,

    /// Default per-request forward timeout in seconds
    #[arg(long, env = "TUNELY_REQUEST_TIMEOUT", default_value = "300")]
    pub request_timeout_s: u64,

    /// Maximum control-channel frame size in bytes
    #[arg(long, env = "TUNELY_MAX_FRAME_BYTES", default_value = "8388608")]
    pub max_frame_bytes: usize,

    /// Bounded queue depth for each streaming response
    #[arg(long, env = "TUNELY_STREAM_QUEUE_DEPTH", default_value = "128")]
    pub stream_queue_depth: usize,

    /// Enable debug logging
    #[arg(long, env = "TUNELY_DEBUG")]
    pub debug: bool,
}

/// Sessions are declared dead after this many heartbeat intervals without
/// evidence of liveness.
pub const HEARTBEAT_GRACE_FACTOR: f64 = 2.5;

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_s)
    }

    /// Silence threshold before a session is closed with `heartbeat_timeout`.
    pub fn heartbeat_grace(&self) -> Duration {
        self.heartbeat_interval().mul_f64(HEARTBEAT_GRACE_FACTOR)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_s)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_s)
    }

    /// The advertised WebSocket URL for agents.
    pub fn ws_url(&self) -> String {
        format!("wss://{}{}", self.domain, self.control_path)
    }
}
