//! Bigfile Server
//!
//! Accepts large files as independently uploaded chunks and merges them
//! into a single artifact on request.

use std::net::SocketAddr;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bigfile_server::config::Config;
use bigfile_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bigfile_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env();

    tracing::info!("Starting Bigfile Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Storage root: {}", config.storage.root.display());
    tracing::info!("Max chunk size: {} bytes", config.storage.max_chunk_bytes);

    let app_state = AppState::new(config.clone());
    app_state
        .uploads()
        .prepare()
        .await
        .with_context(|| format!("failed to prepare storage at {}", config.storage.root.display()))?;

    if config.sweep.enabled() {
        app_state
            .uploads()
            .clone()
            .start_sweeper(config.sweep.interval(), config.sweep.max_age());
        tracing::info!(
            "Stale chunk sweeper enabled (every {}s, max age {}h)",
            config.sweep.interval_secs,
            config.sweep.max_age_hours
        );
    }

    let app = bigfile_server::app(app_state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.server.host, config.server.port))?;
    tracing::info!("Bigfile Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
