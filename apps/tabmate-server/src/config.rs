//! Command-line and environment configuration.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Parser, ValueEnum};
use tabmate_session::HubConfig;
use tabmate_transport::ConnectionConfig;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Server configuration from flags and environment.
#[derive(Parser, Debug)]
#[command(name = "tabmate-server", about = "Shared table ordering server")]
pub struct Config {
    /// Address to listen on.
    #[arg(long, env = "TABMATE_ADDR", default_value = "127.0.0.1:8080")]
    pub addr: SocketAddr,

    /// Database URL. Requires the `sqlite` feature; without it tables live in memory.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Maximum pooled database connections.
    #[arg(long, env = "TABMATE_DB_CONNECTIONS", default_value_t = 5)]
    pub db_connections: u32,

    /// JSON file listing `{token, user_id, display_name}` entries.
    #[arg(long, env = "TABMATE_IDENTITIES")]
    pub identities: Option<PathBuf>,

    /// Skip starting hubs for open tables at boot.
    #[arg(long, env = "TABMATE_NO_WARM_START")]
    pub no_warm_start: bool,

    #[arg(long, env = "TABMATE_LOG_FORMAT", value_enum, default_value = "pretty")]
    pub log_format: LogFormat,

    /// Largest inbound WebSocket frame in bytes.
    #[arg(long, env = "TABMATE_MAX_FRAME_BYTES", default_value_t = 512)]
    pub max_frame_bytes: usize,

    /// Seconds to wait for a pong before dropping a connection.
    #[arg(long, env = "TABMATE_PONG_WAIT_SECS", default_value_t = 60)]
    pub pong_wait_secs: u64,

    /// Frames buffered per connection before it counts as too slow.
    #[arg(long, env = "TABMATE_MAILBOX_CAPACITY", default_value_t = 256)]
    pub mailbox_capacity: usize,

    /// Capacity of each hub coordination queue.
    #[arg(long, env = "TABMATE_HUB_QUEUE", default_value_t = 64)]
    pub hub_queue: usize,
}

impl Config {
    /// Per-connection limits and timers.
    #[must_use]
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            max_frame_bytes: self.max_frame_bytes,
            mailbox_capacity: self.mailbox_capacity,
            ..ConnectionConfig::with_pong_wait(Duration::from_secs(self.pong_wait_secs.max(1)))
        }
    }

    /// Hub queue sizes.
    #[must_use]
    pub const fn hub(&self) -> HubConfig {
        HubConfig {
            queue_capacity: self.hub_queue,
        }
    }
}
