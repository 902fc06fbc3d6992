mod app_state;
mod config;
mod db;
mod error;
mod events;
mod models;
mod services;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use app_state::AppState;
use config::AppConfig;
use services::{
    notify::Notifier,
    processor::ExtractionClient,
    storage,
    triggers::{S3WatchCredentials, TriggerEngine},
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting docbatch engine");

    // Load configuration from environment
    let app_config = AppConfig::from_env().expect("Failed to load configuration");

    // Initialize database
    tracing::info!(database_url = %app_config.database_url, "Opening engine database");
    let db_pool = db::init_pool(&app_config.database_url)
        .await
        .expect("Failed to open database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize services
    let backend = storage::from_config(&app_config).expect("Failed to initialize storage backend");
    tracing::info!(backend = %app_config.storage_backend, "Storage backend ready");

    let processor = Arc::new(ExtractionClient::new(
        app_config.extractor_url.clone(),
        app_config.extractor_api_token.clone(),
    ));

    let notifier = Notifier::new(
        app_config.email_api_url.clone(),
        app_config.email_api_token.clone(),
    );

    let state = AppState::new(db_pool, backend, processor, notifier);

    // Reconcile state left behind by a previous process
    state
        .orchestrator
        .reconcile()
        .await
        .expect("Failed to reconcile engine state");

    // Advisory report on storage that could be archived away.
    match state
        .orchestrator
        .archive_candidates(app_config.archive_inactivity_days)
        .await
    {
        Ok(candidates) if !candidates.is_empty() => {
            let bytes: u64 = candidates.iter().map(|(_, size)| size).sum();
            tracing::info!(
                batches = candidates.len(),
                bytes,
                inactive_days = app_config.archive_inactivity_days,
                "terminal batches eligible for archival"
            );
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "failed to compute archival candidates"),
    }

    // Log status events; the push channel for UI updates plugs in here.
    let mut event_rx = state.events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            tracing::debug!(event = ?event, "status event");
        }
    });

    let engine = TriggerEngine::new(
        state.orchestrator.clone(),
        Arc::clone(&state.notifier),
        S3WatchCredentials::from_config(&app_config),
        Duration::from_secs(app_config.tick_interval_secs),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    engine.run(shutdown_rx).await;
    tracing::info!("docbatch engine stopped");
}
