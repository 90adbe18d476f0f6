//! attrwatch -- continuous anomaly detection for entity attribute streams.
//!
//! Watched attributes are evaluated online against strategies built from
//! their own history: value range, step delta and update interval. Each
//! update is classified, the classification persisted, and alerts raised
//! for outliers.

pub mod api;
pub mod config;
pub mod detect;
pub mod ingest;
pub mod model;
pub mod ports;
pub mod storage;
pub mod watch;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::EngineConfig;
use crate::ingest::{Engine, IngestPipeline};
use crate::storage::alerts::AlertManager;
use crate::storage::SqliteStore;
use crate::watch::WatchRegistry;

/// Open the configured database, returning the store and its alert log.
pub fn open_storage(config: &EngineConfig) -> Result<(SqliteStore, AlertManager)> {
    let path = config
        .storage
        .path
        .to_str()
        .context("storage path is not valid UTF-8")?;
    tracing::info!(%path, "opening database");
    let store = SqliteStore::open(path)?;
    let alerts = AlertManager::new(store.pool().clone());
    Ok((store, alerts))
}

/// Build the evaluation engine over SQLite, with the watch registry loaded
/// from stored entity metadata.
pub fn build_engine(store: &SqliteStore, alerts: &AlertManager) -> Result<Engine> {
    let registry = Arc::new(WatchRegistry::new());
    registry.load(store)?;
    Ok(Engine::new(
        registry,
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(alerts.clone()),
    ))
}

/// Start the attrwatch daemon: ingest pipeline and API server. Returns after
/// ctrl-c once queued updates have drained.
pub async fn serve(config: &EngineConfig) -> Result<()> {
    let (store, alerts) = open_storage(config)?;
    let engine = Arc::new(build_engine(&store, &alerts)?);
    let registry = engine.registry().clone();

    let pipeline = IngestPipeline::spawn(engine, config.ingest.workers, config.ingest.queue_capacity);
    let state = api::state::AppState {
        store,
        alerts,
        registry,
        ingest: pipeline.handle(),
    };
    let app = api::router(state);

    let addr: std::net::SocketAddr = config
        .api
        .listen_address
        .parse()
        .with_context(|| format!("invalid listen address {}", config.api.listen_address))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(%addr, "attrwatch listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pipeline.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
