use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Scalar types
//
// Prices and probabilities arrive in three shapes (fraction, percent, cents).
// Two distinct newtypes keep the scaling explicit at the decode boundary —
// a `Price` is always a fraction in [0,1], a `Pct` is always percentage points.
// ---------------------------------------------------------------------------

/// Market price as a fraction of $1, always within [0,1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(f64);

impl Price {
    /// Accepts raw venue values. Anything above 1 is percent-like input and
    /// is rescaled by 100 before clamping.
    pub fn from_raw(raw: f64) -> Self {
        let scaled = if raw > 1.0 { raw / 100.0 } else { raw };
        Price(scaled.clamp(0.0, 1.0))
    }

    /// Kalshi quotes prices in whole cents.
    pub fn from_cents(cents: i64) -> Self {
        Price((cents as f64 / 100.0).clamp(0.0, 1.0))
    }

    pub fn value(self) -> f64 {
        self.0
    }

    pub fn pct(self) -> Pct {
        Pct(self.0 * 100.0)
    }
}

/// A value in percentage points (probability, spread, deviation).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pct(pub f64);

impl Pct {
    pub fn value(self) -> f64 {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Venues
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Polymarket,
    Kalshi,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Polymarket => write!(f, "polymarket"),
            Platform::Kalshi => write!(f, "kalshi"),
        }
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "polymarket" => Ok(Platform::Polymarket),
            "kalshi" => Ok(Platform::Kalshi),
            other => Err(format!("unknown platform: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// One externally curated catalog row. Read-only to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Market {
    pub market_key: String,
    pub event_name: String,
    pub proposition_text: String,
    pub polymarket_asset_id: Option<String>,
    pub kalshi_ticker: Option<String>,
    pub resolution_date: Option<String>,
    pub settlement_source: Option<String>,
}

// ---------------------------------------------------------------------------
// Normalized quote
// ---------------------------------------------------------------------------

pub const LOW_CONFIDENCE: &str = "low_confidence";

/// One normalized tick, append-only once persisted.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedQuote {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub platform: Platform,
    pub event_id: String,
    pub proposition_name: String,
    pub price: Price,
    pub side: Side,
    pub size: f64,
    pub probability_pct: Pct,
    pub liquidity_depth_usd: f64,
    pub bid_ask_spread_pct: Option<f64>,
    pub volume_24h: Option<f64>,
    pub confidence_flag: Option<&'static str>,
    pub raw_payload: String,
}

// ---------------------------------------------------------------------------
// Relationship graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    Equivalent,
    Implied,
    MutuallyExclusive,
    Correlated,
}

impl RelationshipType {
    /// Tolerant parse for analyst-model output and stored rows. The model
    /// occasionally emits variants like `implied_conditional`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "equivalent" => Some(Self::Equivalent),
            "mutually_exclusive" => Some(Self::MutuallyExclusive),
            "correlated" => Some(Self::Correlated),
            _ if s.starts_with("implied") => Some(Self::Implied),
            _ => None,
        }
    }
}

impl std::fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RelationshipType::Equivalent => "equivalent",
            RelationshipType::Implied => "implied",
            RelationshipType::MutuallyExclusive => "mutually_exclusive",
            RelationshipType::Correlated => "correlated",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpactDirection {
    Positive,
    Negative,
    Neutral,
}

impl ImpactDirection {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "positive" => Some(Self::Positive),
            "negative" => Some(Self::Negative),
            "neutral" => Some(Self::Neutral),
            _ => None,
        }
    }
}

impl std::fmt::Display for ImpactDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ImpactDirection::Positive => "positive",
            ImpactDirection::Negative => "negative",
            ImpactDirection::Neutral => "neutral",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrelationStrength {
    Low,
    Medium,
    High,
    Extreme,
}

impl CorrelationStrength {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "extreme" => Some(Self::Extreme),
            _ => None,
        }
    }
}

impl std::fmt::Display for CorrelationStrength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CorrelationStrength::Low => "low",
            CorrelationStrength::Medium => "medium",
            CorrelationStrength::High => "high",
            CorrelationStrength::Extreme => "extreme",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalLayer {
    Financial,
    Political,
    Statistical,
    Direct,
}

impl LogicalLayer {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "financial" => Some(Self::Financial),
            "political" => Some(Self::Political),
            "statistical" => Some(Self::Statistical),
            "direct" => Some(Self::Direct),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogicalLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogicalLayer::Financial => "financial",
            LogicalLayer::Political => "political",
            LogicalLayer::Statistical => "statistical",
            LogicalLayer::Direct => "direct",
        };
        write!(f, "{s}")
    }
}

/// One unordered pair row. Keys are stored in lexicographic order so each
/// pair has exactly one canonical row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub market_key_a: String,
    pub market_key_b: String,
    pub relationship_type: RelationshipType,
    pub confidence_score: f64,
    pub logic_justification: String,
    pub impact_direction: ImpactDirection,
    pub correlation_strength: CorrelationStrength,
    pub logical_layer: LogicalLayer,
    pub vantage_insight: String,
    pub probability_a: Option<f64>,
    pub probability_b: Option<f64>,
    pub probability_spread: Option<f64>,
    pub arbitrage_flag: Option<String>,
    pub risk_alert: Option<String>,
}

/// Lexicographic canonical ordering for an unordered pair.
pub fn canonical_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

// ---------------------------------------------------------------------------
// Arbitrage alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    /// Both sides resolved from live quotes.
    Alert,
    /// At least one side resolved via the demo fallback table.
    Simulated,
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertStatus::Alert => write!(f, "alert"),
            AlertStatus::Simulated => write!(f, "simulated"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArbitrageAlert {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub market_pair: String,
    pub spread: Pct,
    pub potential_profit_pct: Pct,
    pub status: AlertStatus,
}

// ---------------------------------------------------------------------------
// Scenario reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ShockDirection {
    Up,
    Down,
}

impl ShockDirection {
    pub fn flip(self) -> Self {
        match self {
            ShockDirection::Up => ShockDirection::Down,
            ShockDirection::Down => ShockDirection::Up,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UP" => Some(Self::Up),
            "DOWN" => Some(Self::Down),
            _ => None,
        }
    }
}

impl std::fmt::Display for ShockDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShockDirection::Up => write!(f, "UP"),
            ShockDirection::Down => write!(f, "DOWN"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl std::fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReportStatus::Pending => "pending",
            ReportStatus::Processing => "processing",
            ReportStatus::Complete => "complete",
            ReportStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One step of the causal chain produced by graph traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CausalStep {
    pub market_key: String,
    /// 1 = first-order (directly connected to the shocked market), 2 = second-order.
    pub order: u32,
    pub relationship_type: RelationshipType,
    pub direction: ShockDirection,
    /// Product of edge confidences along `path`.
    pub cumulative_confidence: f64,
    /// Confidence of the final edge on `path`.
    pub edge_confidence: f64,
    /// Market keys from the shocked origin to this node, inclusive.
    pub path: Vec<String>,
    pub logic_justification: String,
    pub vantage_insight: String,
    pub correlation_strength: CorrelationStrength,
    pub logical_layer: LogicalLayer,
    pub probability_a: Option<f64>,
    pub probability_b: Option<f64>,
}

/// One directed edge touched by a scenario, for dashboard highlighting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffectedEdge {
    pub source: String,
    pub target: String,
    pub relationship_type: RelationshipType,
    pub direction: ShockDirection,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub id: Uuid,
    pub query: String,
    pub trigger_market: Option<String>,
    pub causal_chain: Vec<CausalStep>,
    pub narrative: Option<String>,
    pub affected_nodes: Vec<String>,
    pub affected_edges: Vec<AffectedEdge>,
    pub status: ReportStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_boundaries_accepted() {
        assert_eq!(Price::from_raw(1.0).value(), 1.0);
        assert_eq!(Price::from_raw(0.0).value(), 0.0);
    }

    #[test]
    fn percent_like_input_rescaled_then_clamped() {
        // 1.5 is percent-like: rescaled to 0.015
        assert!((Price::from_raw(1.5).value() - 0.015).abs() < 1e-12);
        // 150 rescales to 1.5, which clamps to 1.0
        assert_eq!(Price::from_raw(150.0).value(), 1.0);
        assert_eq!(Price::from_raw(-0.2).value(), 0.0);
    }

    #[test]
    fn cents_scale_to_fraction() {
        assert!((Price::from_cents(64).value() - 0.64).abs() < 1e-12);
        assert_eq!(Price::from_cents(250).value(), 1.0);
    }

    #[test]
    fn probability_pct_is_price_times_100() {
        let p = Price::from_raw(0.64);
        assert!((p.pct().value() - 64.0).abs() < 1e-12);
    }

    #[test]
    fn canonical_pair_orders_lexicographically() {
        assert_eq!(canonical_pair("fed-cut-dec", "btc-100k"), ("btc-100k", "fed-cut-dec"));
        assert_eq!(canonical_pair("a", "b"), ("a", "b"));
    }

    #[test]
    fn relationship_type_accepts_implied_synonyms() {
        assert_eq!(RelationshipType::parse("implied"), Some(RelationshipType::Implied));
        assert_eq!(
            RelationshipType::parse("implied_conditional"),
            Some(RelationshipType::Implied)
        );
        assert_eq!(RelationshipType::parse("nonsense"), None);
    }

    #[test]
    fn shock_direction_flip_is_involutive() {
        assert_eq!(ShockDirection::Up.flip().flip(), ShockDirection::Up);
        assert_eq!(ShockDirection::Down.flip(), ShockDirection::Up);
    }
}
