use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::analyst::{extract_object, AnalystClient};
use crate::catalog::{index_by_key, PriceBook};
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::graph::{affected_edges, affected_nodes, traverse, Graph, TraversalConfig};
use crate::store::Store;
use crate::types::{CausalStep, Market, ReportStatus, ScenarioReport, ShockDirection};

const SHOCK_PARSER_PROMPT: &str = "\
You translate a natural-language market shock into a structured trigger. You \
are given the user's scenario and the market catalog. Pick the single catalog \
market the shock lands on first. You must always return a market — never \
answer that nothing matches; choose the closest fit. For geopolitical \
scenarios, pick the most economically downstream market in the catalog. \
Respond with a single JSON object and nothing else:\n\
{\"target_market\": \"<market_key from the catalog>\", \
\"assumed_change\": \"<what is assumed to happen, 15 words or fewer>\", \
\"direction\": \"UP|DOWN\"}";

const NARRATIVE_PROMPT: &str = "\
You are a senior prediction-market analyst writing a ripple-effect briefing. \
You receive a scenario and the list of impacted markets with their causal \
paths and pre-written relationship notes. Respond with a single JSON object:\n\
{\"executive_summary\": \"3-4 sentences\", \"market_impacts\": [{\"market_key\": \
\"...\", \"order\": 1, \"direction\": \"UP|DOWN\", \"confidence_pct\": 0-100, \
\"statement\": \"...\"}]}\n\
Every statement must follow the template exactly, prefixed with its order \
label: \"First-order: If [market A] moves [UP/DOWN], then [market B] is \
[X]% likely to move [Y] because of their [relationship_type] link.\" Use the \
provided confidence and relationship fields; do not invent numbers.";

pub const NO_CONNECTED_MARKETS_SUMMARY: &str =
    "No connected markets: the relationship graph has no qualifying edges from the shocked market, so no ripple effects were traced.";

#[derive(Debug, Deserialize)]
struct ParsedShock {
    target_market: String,
    assumed_change: String,
    direction: String,
}

#[derive(Debug, Deserialize)]
struct NarrativeOut {
    executive_summary: String,
    #[serde(default)]
    market_impacts: Vec<NarrativeImpact>,
}

#[derive(Debug, Deserialize)]
struct NarrativeImpact {
    statement: String,
}

fn order_label(order: u32) -> String {
    match order {
        1 => "First-order".to_string(),
        2 => "Second-order".to_string(),
        n => format!("Order-{n}"),
    }
}

fn compose_narrative(out: &NarrativeOut) -> String {
    if out.market_impacts.is_empty() {
        return out.executive_summary.clone();
    }
    let statements: Vec<&str> = out.market_impacts.iter().map(|i| i.statement.as_str()).collect();
    format!("{}\n\n{}", out.executive_summary, statements.join("\n"))
}

/// Retrieval-augmented context handed to the narrative prompt: the scenario
/// plus every impact with its path and the classifier's pre-written notes.
fn build_context(
    query: &str,
    shock: &ParsedShock,
    direction: ShockDirection,
    impacts: &[CausalStep],
    by_key: &HashMap<&str, &Market>,
    price_map: &HashMap<String, f64>,
) -> serde_json::Value {
    let target = by_key.get(shock.target_market.as_str());
    serde_json::json!({
        "scenario": {
            "query": query,
            "target_market": shock.target_market,
            "event_name": target.map(|m| m.event_name.clone()),
            "proposition": target.map(|m| m.proposition_text.clone()),
            "assumed_change": shock.assumed_change,
            "direction": direction,
            "current_probability_pct": price_map.get(&shock.target_market),
        },
        "impacted_markets": impacts.iter().map(|impact| {
            let market = by_key.get(impact.market_key.as_str());
            serde_json::json!({
                "market_key": impact.market_key,
                "event_name": market.map(|m| m.event_name.clone()),
                "proposition": market.map(|m| m.proposition_text.clone()),
                "order_label": order_label(impact.order),
                "relationship_type": impact.relationship_type,
                "direction": impact.direction,
                "cumulative_confidence": impact.cumulative_confidence,
                "current_probability_pct": price_map.get(&impact.market_key),
                "causal_path": impact.path,
                "logic_justification": impact.logic_justification,
                "vantage_insight": impact.vantage_insight,
            })
        }).collect::<Vec<_>>(),
    })
}

/// On-demand scenario stress tester. Handles one query at a time; concurrent
/// requests queue on the engine gate.
pub struct ScenarioEngine {
    store: Store,
    analyst: Arc<AnalystClient>,
    cfg: Config,
    gate: Mutex<()>,
}

impl ScenarioEngine {
    pub fn new(store: Store, analyst: Arc<AnalystClient>, cfg: Config) -> Self {
        Self { store, analyst, cfg, gate: Mutex::new(()) }
    }

    /// Run one scenario end to end. Failures after the report row exists are
    /// folded into a `failed` report rather than an error, so the caller
    /// always has a row to show — never a silent hang.
    pub async fn run(&self, query: &str) -> Result<ScenarioReport> {
        let _gate = self.gate.lock().await;

        let id = Uuid::new_v4();
        let created_at = Utc::now();
        self.store.create_report(id, query, created_at).await?;

        match self.execute(id, query).await {
            Ok(report) => Ok(report),
            Err(e) => {
                let message = e.to_string();
                warn!(report = %id, "scenario failed: {message}");
                if let Err(store_err) = self.store.fail_report(id, None, &message).await {
                    error!(report = %id, "could not record scenario failure: {store_err}");
                }
                Ok(ScenarioReport {
                    id,
                    query: query.to_string(),
                    trigger_market: None,
                    causal_chain: Vec::new(),
                    narrative: None,
                    affected_nodes: Vec::new(),
                    affected_edges: Vec::new(),
                    status: ReportStatus::Failed,
                    error: Some(message),
                    created_at,
                })
            }
        }
    }

    async fn execute(&self, id: Uuid, query: &str) -> Result<ScenarioReport> {
        // load graph, catalog and prices
        let relationships = self.store.fetch_relationships().await?;
        let catalog = self.store.fetch_catalog().await?;
        let latest = self.store.latest_signals().await?;
        let book = PriceBook::new(&latest, &self.cfg.demo_probabilities);
        let price_map = book.price_map(&catalog);
        let by_key = index_by_key(&catalog);

        // parse the shock
        let shock = self.parse_shock(query, &catalog).await?;
        let direction = ShockDirection::parse(&shock.direction).ok_or_else(|| {
            AppError::Analyst(format!("shock parser returned direction {:?}", shock.direction))
        })?;
        if !by_key.contains_key(shock.target_market.as_str()) {
            warn!(
                target = %shock.target_market,
                "shock target is not in the catalog — traversing from the supplied key anyway"
            );
        }
        info!(
            target = %shock.target_market,
            %direction,
            change = %shock.assumed_change,
            "scenario shock parsed"
        );

        // bounded breadth-first propagation
        let graph = Graph::build(&relationships);
        info!(
            nodes = graph.node_count(),
            edges = relationships.len(),
            "relationship graph loaded"
        );
        let traversal_cfg = TraversalConfig {
            max_depth: self.cfg.scenario_max_depth,
            min_path_confidence: self.cfg.scenario_min_path_confidence,
        };
        let impacts = traverse(&graph, &shock.target_market, direction, &traversal_cfg);
        let nodes = affected_nodes(&shock.target_market, &impacts);
        let edges = affected_edges(&graph, direction, &impacts);

        // narrative
        let narrative = if impacts.is_empty() {
            NO_CONNECTED_MARKETS_SUMMARY.to_string()
        } else {
            let context = build_context(query, &shock, direction, &impacts, &by_key, &price_map);
            let completion = self.analyst.complete(NARRATIVE_PROMPT, &context.to_string()).await?;
            let out: NarrativeOut = extract_object(&completion)?;
            compose_narrative(&out)
        };

        let report = ScenarioReport {
            id,
            query: query.to_string(),
            trigger_market: Some(shock.target_market.clone()),
            causal_chain: impacts,
            narrative: Some(narrative),
            affected_nodes: nodes,
            affected_edges: edges,
            status: ReportStatus::Complete,
            error: None,
            created_at: Utc::now(),
        };
        self.store.complete_report(&report).await?;
        info!(
            report = %id,
            impacts = report.causal_chain.len(),
            "scenario complete"
        );
        Ok(report)
    }

    async fn parse_shock(&self, query: &str, catalog: &[Market]) -> Result<ParsedShock> {
        let user = serde_json::json!({
            "query": query,
            "catalog": catalog.iter().map(|m| serde_json::json!({
                "market_key": m.market_key,
                "event_name": m.event_name,
                "proposition": m.proposition_text,
            })).collect::<Vec<_>>(),
        })
        .to_string();

        let completion = self.analyst.complete(SHOCK_PARSER_PROMPT, &user).await?;
        extract_object(&completion)
    }
}
