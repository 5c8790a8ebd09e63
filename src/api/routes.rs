use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::health::HealthState;
use crate::batch::BatchWriter;
use crate::catalog::PriceBook;
use crate::config::Config;
use crate::error::AppError;
use crate::graph::classifier::detect_hubs;
use crate::scenario::ScenarioEngine;
use crate::store::Store;
use crate::types::{Platform, Relationship, ScenarioReport};

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub health: Arc<HealthState>,
    pub writer: Arc<BatchWriter>,
    pub engine: Arc<ScenarioEngine>,
    pub cfg: Config,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/api/graph-data", get(get_graph_data))
        .route("/api/scenario", post(post_scenario))
        .route("/api/scenarios", get(get_scenarios))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    polymarket_connected: bool,
    kalshi_connected: bool,
    schema_degraded: bool,
    store_degraded: bool,
    last_quote_at_ms: i64,
    quotes_queued: u64,
    quotes_inserted: u64,
    quotes_dropped: u64,
    write_errors: u64,
}

#[derive(Serialize)]
struct GraphNode {
    market_key: String,
    event_name: String,
    proposition_text: String,
    polymarket_asset_id: Option<String>,
    kalshi_ticker: Option<String>,
    probability_pct: Option<f64>,
    edge_count: usize,
}

#[derive(Serialize)]
struct GraphMeta {
    market_count: usize,
    relationship_count: usize,
    hub_nodes: Vec<String>,
    arbitrage_flag_count: usize,
    divergence_count: usize,
}

#[derive(Serialize)]
struct GraphDataResponse {
    nodes: Vec<GraphNode>,
    edges: Vec<Relationship>,
    meta: GraphMeta,
}

#[derive(Deserialize)]
struct ScenarioRequest {
    query: String,
}

#[derive(Deserialize)]
struct ScenariosQuery {
    limit: Option<i64>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        polymarket_connected: state.health.connected(Platform::Polymarket),
        kalshi_connected: state.health.connected(Platform::Kalshi),
        schema_degraded: state.health.schema_degraded(),
        store_degraded: state.writer.is_degraded(),
        last_quote_at_ms: state.health.last_quote_at_ms(),
        quotes_queued: state.writer.queued_total(),
        quotes_inserted: state.writer.inserted_total(),
        quotes_dropped: state.writer.dropped_total(),
        write_errors: state.writer.error_total(),
    })
}

/// Catalog, relationship edges and latest probabilities joined into the
/// node/edge shape the dashboard renders.
async fn get_graph_data(
    State(state): State<ApiState>,
) -> Result<Json<GraphDataResponse>, AppError> {
    let catalog = state.store.fetch_catalog().await?;
    let relationships = state.store.fetch_relationships().await?;
    let latest = state.store.latest_signals().await?;
    let book = PriceBook::new(&latest, &state.cfg.demo_probabilities);

    let nodes = catalog
        .iter()
        .map(|market| {
            let edge_count = relationships
                .iter()
                .filter(|r| {
                    r.market_key_a == market.market_key || r.market_key_b == market.market_key
                })
                .count();
            GraphNode {
                market_key: market.market_key.clone(),
                event_name: market.event_name.clone(),
                proposition_text: market.proposition_text.clone(),
                polymarket_asset_id: market.polymarket_asset_id.clone(),
                kalshi_ticker: market.kalshi_ticker.clone(),
                probability_pct: book.resolve(market).map(|r| r.probability_pct),
                edge_count,
            }
        })
        .collect();

    let meta = GraphMeta {
        market_count: catalog.len(),
        relationship_count: relationships.len(),
        hub_nodes: detect_hubs(&relationships, state.cfg.hub_link_threshold)
            .into_iter()
            .map(|(key, _)| key)
            .collect(),
        arbitrage_flag_count: relationships.iter().filter(|r| r.arbitrage_flag.is_some()).count(),
        divergence_count: relationships.iter().filter(|r| r.risk_alert.is_some()).count(),
    };

    Ok(Json(GraphDataResponse { nodes, edges: relationships, meta }))
}

/// Runs the scenario synchronously and returns the finished report. A failed
/// run still returns a report row (status `failed`) rather than hanging.
async fn post_scenario(
    State(state): State<ApiState>,
    Json(request): Json<ScenarioRequest>,
) -> Result<Json<ScenarioReport>, AppError> {
    let query = request.query.trim();
    if query.is_empty() {
        return Err(AppError::Config("scenario query must not be empty".to_string()));
    }
    let report = state.engine.run(query).await?;
    Ok(Json(report))
}

async fn get_scenarios(
    State(state): State<ApiState>,
    Query(params): Query<ScenariosQuery>,
) -> Result<Json<Vec<ScenarioReport>>, AppError> {
    let limit = params.limit.unwrap_or(20).clamp(1, 100);
    let reports = state.store.recent_reports(limit).await?;
    Ok(Json(reports))
}
