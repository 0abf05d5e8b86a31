//! Veil Tunnel Client
//!
//! Serves a local SOCKS5 proxy and multiplexes every session over one
//! authenticated TLS WebSocket uplink.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use veil_tunnel::{Client, Config};

/// Veil Tunnel Client - multiplexing SOCKS5-over-WebSocket proxy
#[derive(Parser, Debug)]
#[command(name = "veil-client")]
#[command(about = "Veil Tunnel Client - SOCKS5 over an encrypted WebSocket uplink")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config).context("Failed to load configuration")?;

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&level))
        .init();

    info!("Veil Tunnel Client v{}", veil_tunnel::VERSION);

    let client = Client::connect(config)
        .await
        .context("Failed to establish uplink")?;
    let peer = client.peer();

    tokio::select! {
        result = client.run() => {
            if let Err(e) = result {
                error!("client terminated: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            peer.close();
        }
    }

    Ok(())
}
