//! One-shot relationship classification over the market catalog.
//!
//! Run after curating the catalog; repeat runs upsert onto the canonical
//! pair key, so re-running over an unchanged catalog is idempotent.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vantage_engine::analyst::AnalystClient;
use vantage_engine::config::Config;
use vantage_engine::error::Result;
use vantage_engine::graph::classifier::Classifier;
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
        error!("Classification run failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    let store = Store::connect(&cfg).await?;
    let analyst = Arc::new(AnalystClient::new(&cfg)?);
    let classifier = Classifier::new(store, analyst, cfg);

    let summary = classifier.run().await?;
    info!(
        pairs = summary.pairs_total,
        classified = summary.classified,
        skipped = summary.skipped,
        "done"
    );
    for (key, links) in &summary.hub_nodes {
        info!(market_key = %key, links, "hub");
    }
    Ok(())
}
