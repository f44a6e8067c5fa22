//! Quire document server binary

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use quire_server::{DocumentServer, ServerConfig};

#[derive(Parser)]
#[command(name = "quire-server")]
#[command(about = "Quire document server")]
#[command(version)]
struct Args {
    /// Config file (defaults to ~/.config/quire/server.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the config file
    #[arg(short, long)]
    bind: Option<String>,

    /// Directory for project stores, overriding the config file
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    let path = args.config.unwrap_or_else(ServerConfig::config_file_path);
    let mut config = ServerConfig::load_from_path(&path)?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data directory: {:?}", config.data_dir))?;
    if config.allowed_origins.is_empty() {
        warn!("No allowed origins configured; every connection will be rejected");
    }
    if config.sessions.is_empty() {
        warn!("No sessions configured; every connection will be rejected");
    }

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!(data_dir = ?config.data_dir, "Starting quire-server");

    let server = Arc::new(DocumentServer::from_config(&config));
    tokio::select! {
        result = server.serve(listener) => result.context("Server stopped")?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}

fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("quire_server=info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}
