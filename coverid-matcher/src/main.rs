//! coverid-matcher - Main entry point
//!
//! Comic cover recognition service: HTTP API for submitting cover images,
//! following progress and administering presets and the feature cache.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coverid_matcher::config::{Cli, ServiceConfig};
use coverid_matcher::services::maintenance::{
    spawn_cache_retention, spawn_stale_monitor, CACHE_RETENTION_INTERVAL,
};
use coverid_matcher::{build_router, db, AppState, EngineComponents};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServiceConfig::resolve(&cli).context("Failed to load configuration")?;

    // RUST_LOG wins over the configured level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting coverid-matcher v{} on {}",
        env!("CARGO_PKG_VERSION"),
        config.listen_address()
    );
    info!("Root folder: {}", config.root_folder.display());

    std::fs::create_dir_all(&config.root_folder).with_context(|| {
        format!("Failed to create root folder {}", config.root_folder.display())
    })?;
    let pool = db::init_database_pool(&config.database_path())
        .await
        .context("Failed to initialize database")?;
    info!("Database ready at {}", config.database_path().display());

    let components = EngineComponents::standard(&config).context("Failed to build engine")?;
    let state = AppState::build(pool, config.clone(), components)
        .await
        .context("Failed to initialize services")?;

    let orphans = state
        .orchestrator
        .recover_orphans()
        .await
        .context("Failed to scan unfinished sessions")?;
    if orphans > 0 {
        warn!("{} session(s) were left unfinished by a previous run", orphans);
    }

    match state.cache.evict_expired().await {
        Ok(report) => info!(
            expired = report.expired,
            trimmed = report.trimmed,
            "Startup cache retention finished"
        ),
        Err(e) => warn!("Startup cache retention failed: {}", e),
    }

    let stale_monitor = spawn_stale_monitor(state.orchestrator.clone(), config.stale_check);
    let retention = spawn_cache_retention(state.cache.clone(), CACHE_RETENTION_INTERVAL);

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.listen_address())
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen_address()))?;
    info!("Listening on http://{}", config.listen_address());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    stale_monitor.abort();
    retention.abort();
    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
