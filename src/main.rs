use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vantage_engine::analyst::AnalystClient;
use vantage_engine::api::health::HealthState;
use vantage_engine::api::routes::{router, ApiState};
use vantage_engine::arb::ArbScanner;
use vantage_engine::batch::{BatchWriter, QuoteSink};
use vantage_engine::catalog::display_names;
use vantage_engine::config::Config;
use vantage_engine::error::Result;
use vantage_engine::ingest::kalshi::KalshiSession;
use vantage_engine::ingest::polymarket::PolymarketSession;
use vantage_engine::micro::MicroCache;
use vantage_engine::scenario::ScenarioEngine;
use vantage_engine::store::Store;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Store setup and schema probe ---
    let store = Store::connect(&cfg).await?;
    let health = Arc::new(HealthState::new());
    match store.missing_tables().await {
        Ok(missing) if missing.is_empty() => info!("store schema verified"),
        Ok(missing) => {
            health.set_schema_degraded(true);
            error!(
                ?missing,
                "persistence_unavailable: tables missing from the store — apply schema.sql; \
                 continuing in degraded mode"
            );
        }
        Err(e) => {
            health.set_schema_degraded(true);
            error!("schema probe failed, continuing in degraded mode: {e}");
        }
    }

    // --- Catalog bootstrap (names used to label emitted quotes) ---
    let catalog = match store.fetch_catalog().await {
        Ok(catalog) => catalog,
        Err(e) => {
            warn!("could not load market catalog: {e}");
            Vec::new()
        }
    };
    info!(markets = catalog.len(), "catalog loaded");
    let names = Arc::new(display_names(&catalog));

    // --- Shared runtime state ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cache = Arc::new(MicroCache::new());
    let writer = BatchWriter::new(cfg.batch_size);

    // --- Batch flush loop ---
    let sink: Arc<dyn QuoteSink> = Arc::new(store.clone());
    let writer_task = tokio::spawn(Arc::clone(&writer).run(
        sink,
        Duration::from_millis(cfg.batch_flush_interval_ms.max(100)),
        shutdown_rx.clone(),
    ));

    // --- Venue sessions, each with its own recovery loop ---
    let polymarket = PolymarketSession::new(
        cfg.clone(),
        Arc::clone(&cache),
        Arc::clone(&writer),
        Arc::clone(&health),
        Arc::clone(&names),
        shutdown_rx.clone(),
    );
    tokio::spawn(polymarket.run());

    let kalshi = KalshiSession::new(
        cfg.clone(),
        Arc::clone(&cache),
        Arc::clone(&writer),
        Arc::clone(&health),
        Arc::clone(&names),
        shutdown_rx.clone(),
    );
    tokio::spawn(kalshi.run());

    // --- Arbitrage scanner ---
    let scanner = ArbScanner::new(store.clone(), cfg.clone(), shutdown_rx.clone());
    tokio::spawn(scanner.run());

    // --- Scenario engine + HTTP API ---
    let analyst = Arc::new(AnalystClient::new(&cfg)?);
    let engine = Arc::new(ScenarioEngine::new(store.clone(), analyst, cfg.clone()));
    let state = ApiState {
        store,
        health,
        writer: Arc::clone(&writer),
        engine,
        cfg: cfg.clone(),
    };
    let app = router(state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    // In-flight HTTP work has drained; give the writer its final flush.
    match tokio::time::timeout(Duration::from_secs(10), writer_task).await {
        Ok(_) => info!("shutdown complete"),
        Err(_) => warn!("batch writer did not finish its final flush within the grace period"),
    }

    Ok(())
}

/// Flips the shutdown watch channel when the process receives Ctrl-C. Every
/// long-running loop observes the channel and exits cleanly.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("could not install shutdown handler: {e}");
        return;
    }
    info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);
}
