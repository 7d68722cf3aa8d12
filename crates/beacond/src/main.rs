//! beacond - gossip-based peer-to-peer service discovery daemon

use beacond::config::Config;
use beacond::discovery::Discovery;
use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    let default_directive = if config.verbose {
        "beacond=debug"
    } else {
        "beacond=info"
    };
    let filter = EnvFilter::from_default_env().add_directive(default_directive.parse().unwrap());
    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    info!("beacond v{}", env!("CARGO_PKG_VERSION"));

    match Discovery::start(config).await {
        Ok(discovery) => {
            info!(id = %discovery.id(), node = %discovery.node(), "node up");
            tokio::signal::ctrl_c().await.ok();
            info!("received shutdown signal");
            discovery.shutdown();
        }
        Err(e) => {
            error!("failed to start: {e}");
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
