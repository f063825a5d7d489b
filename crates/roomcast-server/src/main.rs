//! # Roomcast Server
//!
//! Relays chat messages between WebSocket clients grouped into rooms.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! roomcast
//!
//! # Listen on a specific address
//! roomcast --addr :9000
//!
//! # Run with custom config
//! roomcast --config /path/to/roomcast.toml
//!
//! # Run with environment variables
//! ROOMCAST_PORT=8080 ROOMCAST_KEEPALIVE__PONG_WAIT_MS=5000 roomcast
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(name = "roomcast", version, about)]
struct Args {
    /// HTTP service address, e.g. `:8080` or `127.0.0.1:8080`
    #[arg(long)]
    addr: Option<String>,

    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "roomcast_server=info,roomcast_core=info,roomcast_transport=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let mut config = config::Config::load(args.config.as_deref())?;
    if let Some(addr) = &args.addr {
        config.apply_listen_addr(addr)?;
    }

    tracing::info!("Starting roomcast server on {}:{}", config.host, config.port);

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args() {
        let args = Args::parse_from(["roomcast", "--addr", ":9000"]);
        assert_eq!(args.addr.as_deref(), Some(":9000"));
        assert!(args.config.is_none());

        let args = Args::parse_from(["roomcast", "--config", "/tmp/roomcast.toml"]);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/roomcast.toml")));
    }
}
