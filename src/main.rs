//! oraclecast — entry point
//!
//! Loads configuration, initialises structured logging, opens the tick
//! store, wires the ingestion pipeline and the calibration loop, and serves
//! the read-only query API.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use oraclecast::adapter::AdapterRegistry;
use oraclecast::aggregate::Aggregator;
use oraclecast::api::{self, ApiState};
use oraclecast::calibration::CalibrationEngine;
use oraclecast::config::AppConfig;
use oraclecast::ingest::{self, TickIngestor};
use oraclecast::prediction::PredictionService;
use oraclecast::retry::RetryPolicy;
use oraclecast::store::TickStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load()?;
    info!(digest = %config.digest(), "oraclecast starting up");

    let store = TickStore::open(&config.store.db_path)?;
    for oracle in &config.oracles {
        store.seed_oracle_config(&oracle.to_oracle_config()?)?;
    }

    let aggregator = Aggregator::new(
        store.clone(),
        config.ingest.lookback_ms,
        config.ingest.forward_slack_ms,
    );
    let registry = AdapterRegistry::from_specs(&config.oracles, config.baseline_symbol())?;
    let service = PredictionService::new(store.clone(), aggregator.clone(), registry);

    // -- Ingestion pipeline ----------------------------------------------

    let ingestor = Arc::new(TickIngestor::new(
        store.clone(),
        aggregator.clone(),
        Duration::from_millis(config.ingest.flush_interval_ms),
    ));
    let (tx, rx) = tokio::sync::mpsc::channel(4_096);
    let _stream_tasks = ingest::spawn_sources(&config.feeds, tx);
    let _event_task = Arc::clone(&ingestor).spawn_event_loop(rx);
    let _flush_task = Arc::clone(&ingestor).spawn_flush_task();

    ingestor
        .backfill(
            &config.feeds,
            config.ingest.backfill_minutes,
            RetryPolicy::default(),
        )
        .await;

    // -- Calibration loop ------------------------------------------------

    if config.calibration.enabled && !config.oracles.is_empty() {
        let engine = CalibrationEngine::new(
            store.clone(),
            aggregator.clone(),
            config.feeds.clone(),
            config.calibration.clone(),
        );
        let specs = config.oracles.clone();
        let interval = Duration::from_secs(config.calibration.interval_secs);
        tokio::spawn(async move {
            loop {
                engine.run_all(&specs).await;
                tokio::time::sleep(interval).await;
            }
        });
    }

    // -- Query API -------------------------------------------------------

    let state = Arc::new(ApiState {
        service,
        aggregator,
        store,
    });
    let router = api::create_router(state);
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(addr = %config.server.bind_addr, "Serving query API");
    axum::serve(listener, router)
        .await
        .context("API server exited")?;

    Ok(())
}
