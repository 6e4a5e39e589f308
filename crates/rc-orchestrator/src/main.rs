//! roboclaw-deploy dashboard
//!
//! Serves the deployment and onboarding API on the local machine.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rc_core::config::{self, DashboardConfig};
use rc_orchestrator::{http, AppState};

#[derive(Parser)]
#[command(name = "roboclaw-dashboard")]
#[command(about = "roboclaw-deploy dashboard server")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting roboclaw-deploy dashboard");

    let config: DashboardConfig = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        config::load_or_default(&default_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
            DashboardConfig::default()
        })
    };

    let bind_addr = args
        .bind
        .unwrap_or_else(|| config.bind_address.clone());

    let state = Arc::new(AppState::new(config).context("Failed to create cloud client")?);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    http::serve(listener, Arc::clone(&state), cancel)
        .await
        .context("HTTP server failed")?;

    // Forwards opened while connections were draining
    state.tunnels.shutdown().await;

    tracing::info!("Dashboard shutdown complete");
    Ok(())
}

/// Cancels `token` on Ctrl+C or SIGTERM
async fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted, stopping dashboard"),
        _ = sigterm => tracing::info!("Terminated, stopping dashboard"),
    }

    token.cancel();
}
