// src/main.rs

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hmo_bridge::prelude::*;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "hmo-bridge", version, about = "Serves videos to set-top receivers and pulls their recordings")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "hmo-bridge.toml")]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load(&args.config)
        .await
        .with_context(|| format!("loading {}", args.config.display()))?;

    let sources = Arc::new(config.sources()?);
    let connector: Arc<dyn SourceConnector> = sources.clone();
    let manager = Arc::new(DownloadManager::new(connector, config.manager_options()?)?);
    let server = Arc::new(MediaServer::new(&config, manager.clone(), sources));

    let addr = SocketAddr::new(config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, shares = config.shares.len(), receivers = config.receivers.len(), "listening");

    axum::serve(listener, server.router().into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    manager.shutdown().await;
    Ok(())
}
