//! wsrelay agent daemon
//!
//! Listens for controller connections and relays sockets, files and
//! authentication handshakes on their behalf.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::Path;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use wsrelay_daemon::config::{AgentConfig, TransportMode};
use wsrelay_daemon::{handler, metrics};

/// wsrelay agent - token-multiplexed socket relay
#[derive(Parser, Debug)]
#[command(name = "wsrelayd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "wsrelay.toml")]
    config: String,

    /// Override the listener address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Override the transport mode (websocket or stream)
    #[arg(short, long)]
    mode: Option<TransportMode>,

    /// Run in verbose mode
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("wsrelay agent v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = if Path::new(&args.config).exists() {
        let config = AgentConfig::load(&args.config).await?;
        info!("Loaded configuration from {}", args.config);
        config
    } else {
        warn!("Config file {} not found, using defaults", args.config);
        AgentConfig::default()
    };

    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(mode) = args.mode {
        config.server.mode = mode;
    }

    // Start metrics server
    let metrics_handle = metrics::start_server(&config.monitoring);

    info!("Starting agent on {} ({})", config.server.bind, config.server.mode);
    let result = handler::run(&config).await;

    // Cleanup
    metrics_handle.abort();

    result
}
