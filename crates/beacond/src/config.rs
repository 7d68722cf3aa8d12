//! Configuration for beacond

use clap::Parser;
use std::net::{Ipv4Addr, SocketAddr};

/// beacond - decentralized service discovery daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "beacond")]
#[command(about = "Gossip-based peer-to-peer service discovery daemon")]
pub struct Config {
    /// TCP listen port (0 picks an ephemeral port)
    #[arg(short, long, default_value_t = 18888)]
    pub port: u16,

    /// Bootstrap peers (comma-separated addresses)
    #[arg(long, value_delimiter = ',')]
    pub seed: Vec<SocketAddr>,

    /// Host advertised to peers
    #[arg(long, default_value = "127.0.0.1")]
    pub advertise: String,

    /// TTL advertised for this node and its publications, in milliseconds
    #[arg(long, default_value_t = 8 * 60 * 60 * 1000)]
    pub ttl_ms: u64,

    /// Base mesh maintenance interval in milliseconds (each tick is
    /// jittered by up to 25% either way)
    #[arg(long, default_value_t = 60_000)]
    pub period_ms: u64,

    /// Handshake timeout for new connections, in milliseconds
    #[arg(long, default_value_t = 10_000)]
    pub conn_exp_thresh_ms: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ttl_ms == 0 {
            anyhow::bail!("ttl must be nonzero");
        }
        if self.period_ms == 0 {
            anyhow::bail!("period must be nonzero");
        }
        if self.advertise.is_empty() {
            anyhow::bail!("advertise host cannot be empty");
        }
        Ok(())
    }

    /// The address to bind the listen socket to.
    pub fn listen_addr(&self) -> SocketAddr {
        (Ipv4Addr::UNSPECIFIED, self.port).into()
    }
}
