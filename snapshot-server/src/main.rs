mod config;
mod error;
mod routes;
mod services;
mod state;

use crate::config::AppConfig;
use crate::services::housekeeping::HousekeepingScheduler;
use crate::state::AppState;
use snapshot_engine::{utils, Config, Engine};
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();
    let engine_config = Config::load(config.snapshot_config.as_deref())?;

    // Initialize logging
    let log_dir = engine_config
        .log
        .file
        .then(|| engine_config.storage.base_dir.join("logs"));
    utils::logger::init(&engine_config.log.level, log_dir.as_deref())?;

    tracing::info!(
        "Starting snapshot server v{} on port {}",
        env!("CARGO_PKG_VERSION"),
        config.port
    );
    if config.api_token.is_none() {
        tracing::warn!("API_TOKEN is not set, /api routes are unauthenticated");
    }

    let engine = tokio::task::spawn_blocking(move || Engine::from_config(engine_config)).await??;
    let state = Arc::new(AppState::new(engine, config.clone()));

    // Initialize cron scheduler
    let scheduler = if config.housekeeping_cron.is_empty() {
        None
    } else {
        match HousekeepingScheduler::new(state.clone()).await {
            Ok(s) => {
                if let Err(e) = s.schedule(&config.housekeeping_cron).await {
                    tracing::warn!("Failed to schedule housekeeping: {}", e);
                }
                if let Err(e) = s.start().await {
                    tracing::warn!("Failed to start scheduler: {}", e);
                }
                Some(s)
            }
            Err(e) => {
                tracing::warn!("Failed to create scheduler: {}", e);
                None
            }
        }
    };

    // Build router
    let app = routes::create_router(state.clone());

    // Start HTTP server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down...");
    if let Some(s) = scheduler {
        if let Err(e) = s.shutdown().await {
            tracing::warn!("Scheduler shutdown error: {}", e);
        }
    }
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
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
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
