//! Kage - Entry Point
//!
//! CLI application for running the Shadowsocks 2022 client.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};

use kage::{client::resolve_address, Client, Config, VERSION};

/// Kage - Shadowsocks 2022 client with SOCKS5 and tunnel front-ends
#[derive(Parser)]
#[command(name = "kage")]
#[command(version = VERSION)]
#[command(about = "Shadowsocks 2022 client with SOCKS5 and tunnel front-ends")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the client
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Check the configuration and probe the server address
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_client(config).await,
        Commands::Check { config } => check(config).await,
    }
}

async fn run_client(config_path: PathBuf) -> Result<()> {
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_tracing(&config.logging);

    info!(
        version = VERSION,
        config_path = ?config_path,
        "Starting kage"
    );

    let config = Arc::new(config);
    let client = Client::new(config.clone());

    info!(
        listen = %config.client.listen,
        server = %config.server.address,
        protocol = ?config.client.protocol,
        mode = ?config.client.mode,
        "Client started"
    );

    tokio::select! {
        result = client.run() => {
            if let Err(e) = result {
                error!(error = %e, "Client error");
                return Err(e);
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            client.shutdown();
        }
    }

    info!("Client stopped");
    Ok(())
}

async fn check(config_path: PathBuf) -> Result<()> {
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let server_addr = resolve_address(&config.server.address).await?;
    info!(addr = %server_addr, "Probing server");

    tokio::time::timeout(
        Duration::from_secs(5),
        tokio::net::TcpStream::connect(server_addr),
    )
    .await
    .context("Connection timed out")?
    .context("Connection failed")?;

    info!("Server is reachable");
    Ok(())
}

fn init_tracing(logging_config: &kage::config::LoggingConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging_config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if logging_config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
