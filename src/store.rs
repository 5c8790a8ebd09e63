use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, QueryBuilder, Row};
use tracing::warn;
use uuid::Uuid;

use crate::batch::QuoteSink;
use crate::config::{Config, LATEST_SIGNAL_SCAN_LIMIT};
use crate::error::{AppError, Result};
use crate::types::{
    AffectedEdge, ArbitrageAlert, CausalStep, CorrelationStrength, ImpactDirection, LogicalLayer,
    Market, NormalizedQuote, Relationship, RelationshipType, ReportStatus, ScenarioReport,
};

pub const REQUIRED_TABLES: [&str; 5] = [
    "market_metadata",
    "market_signals",
    "market_relationships",
    "arbitrage_alerts",
    "scenario_reports",
];

/// Latest persisted signal for one exchange-side identifier.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SignalSnapshot {
    pub event_id: String,
    pub platform: String,
    pub probability_pct: f64,
    pub liquidity_depth_usd: f64,
    pub timestamp: DateTime<Utc>,
}

/// Thin wrapper over the externally curated relational store.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(cfg: &Config) -> Result<Self> {
        let mut options: PgConnectOptions = cfg.database_url.parse()?;
        if let Some(key) = &cfg.database_service_key {
            options = options.password(key);
        }
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Schema probe. The store is externally owned, so drift is reported as
    /// a list of missing tables rather than auto-migrated away.
    pub async fn missing_tables(&self) -> Result<Vec<&'static str>> {
        let mut missing = Vec::new();
        for table in REQUIRED_TABLES {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = $1)",
            )
            .bind(table)
            .fetch_one(&self.pool)
            .await?;
            if !exists {
                missing.push(table);
            }
        }
        Ok(missing)
    }

    // -----------------------------------------------------------------------
    // Catalog
    // -----------------------------------------------------------------------

    pub async fn fetch_catalog(&self) -> Result<Vec<Market>> {
        let rows = sqlx::query_as::<_, Market>(
            "SELECT market_key, event_name, proposition_text, polymarket_asset_id, \
             kalshi_ticker, resolution_date, settlement_source \
             FROM market_metadata ORDER BY market_key",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| table_error(e, "market_metadata"))?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Signals
    // -----------------------------------------------------------------------

    /// Latest signal per identifier: scan recent rows in descending timestamp
    /// order, first occurrence per identifier wins.
    pub async fn latest_signals(&self) -> Result<HashMap<String, SignalSnapshot>> {
        let rows = sqlx::query_as::<_, SignalSnapshot>(
            "SELECT event_id, platform, probability_pct, liquidity_depth_usd, timestamp \
             FROM market_signals ORDER BY timestamp DESC LIMIT $1",
        )
        .bind(LATEST_SIGNAL_SCAN_LIMIT)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| table_error(e, "market_signals"))?;

        let mut latest = HashMap::new();
        for row in rows {
            latest.entry(row.event_id.clone()).or_insert(row);
        }
        Ok(latest)
    }

    // -----------------------------------------------------------------------
    // Relationships
    // -----------------------------------------------------------------------

    pub async fn fetch_relationships(&self) -> Result<Vec<Relationship>> {
        let rows = sqlx::query_as::<_, RelationshipRow>(
            "SELECT market_key_a, market_key_b, relationship_type, confidence_score, \
             logic_justification, impact_direction, correlation_strength, logical_layer, \
             vantage_insight, probability_a, probability_b, probability_spread, \
             arbitrage_flag, risk_alert \
             FROM market_relationships",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| table_error(e, "market_relationships"))?;

        Ok(rows.into_iter().filter_map(RelationshipRow::into_relationship).collect())
    }

    pub async fn fetch_relationships_of(
        &self,
        relationship_type: RelationshipType,
    ) -> Result<Vec<Relationship>> {
        let all = self.fetch_relationships().await?;
        Ok(all
            .into_iter()
            .filter(|r| r.relationship_type == relationship_type)
            .collect())
    }

    pub async fn upsert_relationship(&self, rel: &Relationship) -> Result<()> {
        sqlx::query(
            "INSERT INTO market_relationships (\
                market_key_a, market_key_b, relationship_type, confidence_score, \
                logic_justification, impact_direction, correlation_strength, logical_layer, \
                vantage_insight, probability_a, probability_b, probability_spread, \
                arbitrage_flag, risk_alert) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
             ON CONFLICT (market_key_a, market_key_b) DO UPDATE SET \
                relationship_type = EXCLUDED.relationship_type, \
                confidence_score = EXCLUDED.confidence_score, \
                logic_justification = EXCLUDED.logic_justification, \
                impact_direction = EXCLUDED.impact_direction, \
                correlation_strength = EXCLUDED.correlation_strength, \
                logical_layer = EXCLUDED.logical_layer, \
                vantage_insight = EXCLUDED.vantage_insight, \
                probability_a = EXCLUDED.probability_a, \
                probability_b = EXCLUDED.probability_b, \
                probability_spread = EXCLUDED.probability_spread, \
                arbitrage_flag = EXCLUDED.arbitrage_flag, \
                risk_alert = EXCLUDED.risk_alert",
        )
        .bind(&rel.market_key_a)
        .bind(&rel.market_key_b)
        .bind(rel.relationship_type.to_string())
        .bind(rel.confidence_score)
        .bind(&rel.logic_justification)
        .bind(rel.impact_direction.to_string())
        .bind(rel.correlation_strength.to_string())
        .bind(rel.logical_layer.to_string())
        .bind(&rel.vantage_insight)
        .bind(rel.probability_a)
        .bind(rel.probability_b)
        .bind(rel.probability_spread)
        .bind(&rel.arbitrage_flag)
        .bind(&rel.risk_alert)
        .execute(&self.pool)
        .await
        .map_err(|e| table_error(e, "market_relationships"))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Alerts
    // -----------------------------------------------------------------------

    pub async fn insert_alert(&self, alert: &ArbitrageAlert) -> Result<()> {
        sqlx::query(
            "INSERT INTO arbitrage_alerts (id, timestamp, market_pair, spread, potential_profit_pct, status) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(alert.id)
        .bind(alert.timestamp)
        .bind(&alert.market_pair)
        .bind(alert.spread.value())
        .bind(alert.potential_profit_pct.value())
        .bind(alert.status.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| table_error(e, "arbitrage_alerts"))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Scenario reports
    // -----------------------------------------------------------------------

    pub async fn create_report(&self, id: Uuid, query: &str, created_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO scenario_reports (id, query, status, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(query)
        .bind(ReportStatus::Processing.to_string())
        .bind(created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| table_error(e, "scenario_reports"))?;
        Ok(())
    }

    pub async fn complete_report(&self, report: &ScenarioReport) -> Result<()> {
        sqlx::query(
            "UPDATE scenario_reports SET trigger_market = $2, causal_chain = $3, narrative = $4, \
             affected_nodes = $5, affected_edges = $6, status = $7, error = NULL WHERE id = $1",
        )
        .bind(report.id)
        .bind(&report.trigger_market)
        .bind(serde_json::to_string(&report.causal_chain)?)
        .bind(&report.narrative)
        .bind(serde_json::to_string(&report.affected_nodes)?)
        .bind(serde_json::to_string(&report.affected_edges)?)
        .bind(ReportStatus::Complete.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| table_error(e, "scenario_reports"))?;
        Ok(())
    }

    pub async fn fail_report(&self, id: Uuid, trigger_market: Option<&str>, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE scenario_reports SET trigger_market = $2, status = $3, error = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(trigger_market)
        .bind(ReportStatus::Failed.to_string())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| table_error(e, "scenario_reports"))?;
        Ok(())
    }

    pub async fn recent_reports(&self, limit: i64) -> Result<Vec<ScenarioReport>> {
        let rows = sqlx::query(
            "SELECT id, query, trigger_market, causal_chain, narrative, affected_nodes, \
             affected_edges, status, error, created_at \
             FROM scenario_reports ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| table_error(e, "scenario_reports"))?;

        let mut reports = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            let status = match status.as_str() {
                "pending" => ReportStatus::Pending,
                "processing" => ReportStatus::Processing,
                "complete" => ReportStatus::Complete,
                _ => ReportStatus::Failed,
            };
            let causal_chain: Vec<CausalStep> = row
                .try_get::<Option<String>, _>("causal_chain")?
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default();
            let affected_nodes: Vec<String> = row
                .try_get::<Option<String>, _>("affected_nodes")?
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default();
            let affected_edges: Vec<AffectedEdge> = row
                .try_get::<Option<String>, _>("affected_edges")?
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default();

            reports.push(ScenarioReport {
                id: row.try_get("id")?,
                query: row.try_get("query")?,
                trigger_market: row.try_get("trigger_market")?,
                causal_chain,
                narrative: row.try_get("narrative")?,
                affected_nodes,
                affected_edges,
                status,
                error: row.try_get("error")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(reports)
    }
}

#[async_trait]
impl QuoteSink for Store {
    async fn insert_quotes(&self, quotes: &[NormalizedQuote]) -> Result<()> {
        if quotes.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO market_signals (id, timestamp, platform, event_id, proposition_name, \
             price, side, size, probability_pct, liquidity_depth_usd, bid_ask_spread_pct, \
             volume_24h, confidence_flag, raw_payload) ",
        );
        qb.push_values(quotes, |mut b, q| {
            b.push_bind(q.id)
                .push_bind(q.timestamp)
                .push_bind(q.platform.to_string())
                .push_bind(&q.event_id)
                .push_bind(&q.proposition_name)
                .push_bind(q.price.value())
                .push_bind(q.side.to_string())
                .push_bind(q.size)
                .push_bind(q.probability_pct.value())
                .push_bind(q.liquidity_depth_usd)
                .push_bind(q.bid_ask_spread_pct)
                .push_bind(q.volume_24h)
                .push_bind(q.confidence_flag)
                .push_bind(&q.raw_payload);
        });
        qb.build()
            .execute(&self.pool)
            .await
            .map_err(|e| table_error(e, "market_signals"))?;
        Ok(())
    }
}

/// Raw relationship row; enum columns arrive as text and are parsed
/// tolerantly, skipping rows this build does not understand.
#[derive(sqlx::FromRow)]
struct RelationshipRow {
    market_key_a: String,
    market_key_b: String,
    relationship_type: String,
    confidence_score: f64,
    logic_justification: String,
    impact_direction: String,
    correlation_strength: String,
    logical_layer: String,
    vantage_insight: String,
    probability_a: Option<f64>,
    probability_b: Option<f64>,
    probability_spread: Option<f64>,
    arbitrage_flag: Option<String>,
    risk_alert: Option<String>,
}

impl RelationshipRow {
    fn into_relationship(self) -> Option<Relationship> {
        let Some(relationship_type) = RelationshipType::parse(&self.relationship_type) else {
            warn!(
                pair = %format!("{}|{}", self.market_key_a, self.market_key_b),
                raw = %self.relationship_type,
                "skipping relationship row with unknown type"
            );
            return None;
        };
        Some(Relationship {
            market_key_a: self.market_key_a,
            market_key_b: self.market_key_b,
            relationship_type,
            confidence_score: self.confidence_score.clamp(0.0, 1.0),
            logic_justification: self.logic_justification,
            impact_direction: ImpactDirection::parse(&self.impact_direction)
                .unwrap_or(ImpactDirection::Neutral),
            correlation_strength: CorrelationStrength::parse(&self.correlation_strength)
                .unwrap_or(CorrelationStrength::Low),
            logical_layer: LogicalLayer::parse(&self.logical_layer).unwrap_or(LogicalLayer::Direct),
            vantage_insight: self.vantage_insight,
            probability_a: self.probability_a,
            probability_b: self.probability_b,
            probability_spread: self.probability_spread,
            arbitrage_flag: self.arbitrage_flag,
            risk_alert: self.risk_alert,
        })
    }
}

/// Map Postgres `undefined_table` (42P01) onto the degraded-mode error so
/// callers can tell schema drift apart from transient write failures.
fn table_error(e: sqlx::Error, table: &str) -> AppError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some("42P01") {
            return AppError::PersistenceUnavailable(table.to_string());
        }
    }
    AppError::Database(e)
}
