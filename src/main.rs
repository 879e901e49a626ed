//! QUIC HTTP tunnel
//!
//! # Architecture Overview
//!
//! ```text
//!   ┌──────────── client ─────────────┐            ┌──────────── server ─────────────┐
//!   │                                 │            │                                 │
//!   │  local app ──▶ ingress listener │   QUIC     │  QUIC listener ──▶ processor    │
//!   │                 │               │  stream    │                      │          │
//!   │                 ▼               │ ─────────▶ │                      ▼          │
//!   │   processor ──▶ dialer + pool ──┼────────────┼─▶               forwarder ──────┼──▶ origin
//!   │                                 │            │                HTTP/3 first,    │   (h3 / h2 / h1)
//!   │  local app ◀── response ◀───────┼────────────┼── response ◀── then h2/h1.1     │
//!   └─────────────────────────────────┘            └─────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use quic_tunnel::config::{self, Role, TunnelConfig};
use quic_tunnel::lifecycle::{shutdown_signal, Shutdown};
use quic_tunnel::observability::{self, metrics};
use quic_tunnel::{TunnelClient, TunnelServer};

#[derive(Parser)]
#[command(name = "quic-tunnel")]
#[command(about = "Tunnel HTTP traffic over QUIC", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel server (QUIC listener, forwards to origins)
    Server {
        /// Path to the TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override server.listen_address
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Run the tunnel client (local TCP listener, dials the server)
    Client {
        /// Path to the TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override client.listen_address
        #[arg(short, long)]
        listen: Option<String>,
    },
}

fn load(path: Option<PathBuf>, role: Role, apply: impl FnOnce(&mut TunnelConfig)) -> Result<TunnelConfig, Box<dyn std::error::Error>> {
    let mut config = match path {
        Some(path) => config::load_config(&path, role)?,
        None => TunnelConfig::default(),
    };
    apply(&mut config);
    config::validate_config(&config, role).map_err(config::ConfigError::Validation)?;
    Ok(config)
}

fn init_observability(config: &TunnelConfig) -> Result<(), Box<dyn std::error::Error>> {
    observability::init_logging(&config.observability)?;

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let shutdown = Shutdown::new();

    match cli.command {
        Commands::Server { config, listen } => {
            let config = load(config, Role::Server, |c| {
                if let Some(listen) = listen {
                    c.server.listen_address = listen;
                }
            })?;
            init_observability(&config)?;
            tracing::info!(version = env!("CARGO_PKG_VERSION"), "quic-tunnel server starting");

            let server = TunnelServer::bind(&config)?;
            tokio::spawn(shutdown_signal(shutdown.clone()));
            server.run(shutdown).await?;
            server.shutdown().await?;
        }
        Commands::Client { config, listen } => {
            let config = load(config, Role::Client, |c| {
                if let Some(listen) = listen {
                    c.client.listen_address = listen;
                }
            })?;
            init_observability(&config)?;
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                server_address = %config.client.server_address,
                pool_connections = config.client.pool_connections,
                "quic-tunnel client starting"
            );

            let client = TunnelClient::bind(&config).await?;
            tokio::spawn(shutdown_signal(shutdown.clone()));
            client.run(shutdown).await?;
            client.shutdown().await?;
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
