//! bifrost tunnel client
//!
//! Connects to a relay server and exposes a local HTTP service through it.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bf_client::TunnelClient;
use bf_core::config::{self, ClientConfig};

#[derive(Parser)]
#[command(name = "bifrost")]
#[command(about = "bifrost - expose a local HTTP service through a relay")]
#[command(version)]
struct Args {
    /// Relay server host
    #[arg(long, env = "BIFROST_RELAY_HOST")]
    relay_host: Option<String>,

    /// Relay server port
    #[arg(long, env = "BIFROST_RELAY_PORT")]
    relay_port: Option<u16>,

    /// Port of the local HTTP service to expose
    #[arg(short = 'p', long, env = "BIFROST_LOCAL_PORT")]
    local_port: Option<u16>,

    /// Host of the local HTTP service
    #[arg(long, env = "BIFROST_LOCAL_HOST")]
    local_host: Option<String>,

    /// Maximum number of requests forwarded concurrently
    #[arg(long)]
    max_in_flight: Option<usize>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);

    let mut config = if config_path.exists() {
        config::load_config(&config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else if args.config.is_some() {
        anyhow::bail!("Config file {:?} does not exist", config_path);
    } else {
        ClientConfig::default()
    };

    // Apply command-line overrides
    if let Some(host) = args.relay_host {
        config.relay_host = host;
    }
    if let Some(port) = args.relay_port {
        config.relay_port = port;
    }
    if let Some(port) = args.local_port {
        config.local_port = port;
    }
    if let Some(host) = args.local_host {
        config.local_host = host;
    }
    if let Some(limit) = args.max_in_flight {
        config.max_in_flight = Some(limit);
    }

    let client = TunnelClient::new(config).context("Invalid configuration")?;
    tracing::info!(
        "Exposing {} through relay {}",
        client.config().local_base_url(),
        client.config().relay_address()
    );

    let tunnel = client
        .connect()
        .await
        .context("Failed to establish tunnel")?;

    tracing::info!("Client ID:  {}", tunnel.client_id());
    tracing::info!("Public URL: {}", tunnel.public_url());

    // Ctrl-C closes the tunnel; in-flight requests get the grace period
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            trigger.cancel();
        }
    });

    let summary = tunnel.run(shutdown).await.context("Tunnel failed")?;
    tracing::info!(
        requests = summary.requests,
        decode_errors = summary.decode_errors,
        abandoned = summary.abandoned,
        "Tunnel closed ({:?})",
        summary.close_reason
    );

    Ok(())
}
