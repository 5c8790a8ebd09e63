use crate::error::{AppError, Result};

pub const POLYMARKET_WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/market";
pub const KALSHI_WS_URL: &str = "wss://api.elections.kalshi.com/trade-api/ws/v2";

/// Path string signed into the Kalshi connection headers.
pub const KALSHI_WS_SIGN_PATH: &str = "/trade-api/ws/v2";

/// Application-level liveness probe interval for both venue sessions.
pub const KEEPALIVE_INTERVAL_SECS: u64 = 20;

/// How many recent signal rows the latest-quote scan reads before folding
/// first-seen-per-identifier.
pub const LATEST_SIGNAL_SCAN_LIMIT: i64 = 500;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub api_port: u16,

    // --- Venue sessions ---
    pub polymarket_ws_url: String,
    /// Asset ids subscribed on the Polymarket market channel (POLYMARKET_ASSET_IDS).
    pub polymarket_asset_ids: Vec<String>,
    pub polymarket_api_key: Option<String>,
    pub kalshi_ws_url: String,
    /// Tickers subscribed on the Kalshi trade + ticker channels (KALSHI_TICKERS).
    pub kalshi_tickers: Vec<String>,
    pub kalshi_api_key: Option<String>,
    /// Base64-wrapped PEM private key used to sign the connection headers.
    pub kalshi_private_key_base64: Option<String>,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,

    // --- Batch writer ---
    pub batch_size: usize,
    pub batch_flush_interval_ms: u64,

    // --- Arbitrage scanner ---
    pub arbitrage_poll_interval_ms: u64,
    pub arbitrage_spread_threshold_pct: f64,
    pub arbitrage_liquidity_threshold_usd: f64,

    // --- Relationship classifier ---
    pub classifier_concurrency: usize,
    pub arbitrage_flag_threshold_pct: f64,
    pub divergence_threshold_pct: f64,
    pub hub_link_threshold: usize,

    // --- Scenario engine ---
    pub scenario_max_depth: u32,
    pub scenario_min_path_confidence: f64,

    // --- Analyst model ---
    pub analyst_model_endpoint: String,
    pub analyst_model_api_key: Option<String>,
    pub analyst_model_name: String,

    // --- Persistent store ---
    pub database_url: String,
    /// Optional password override for managed stores whose connection string
    /// omits the credential (DATABASE_SERVICE_KEY).
    pub database_service_key: Option<String>,

    /// Fallback probabilities (pct) keyed by market_key, used when no live
    /// quote exists for a side (DEMO_PROBABILITIES, JSON object).
    pub demo_probabilities: std::collections::HashMap<String, f64>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let demo_probabilities = match std::env::var("DEMO_PROBABILITIES") {
            Ok(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw).map_err(|e| {
                AppError::Config(format!("DEMO_PROBABILITIES must be a JSON object of market_key -> pct: {e}"))
            })?,
            _ => std::collections::HashMap::new(),
        };

        Ok(Self {
            log_level: env_or("LOG_LEVEL", "info"),
            api_port: parse_env("API_PORT", 3000)?,

            polymarket_ws_url: env_or("POLYMARKET_WS_URL", POLYMARKET_WS_URL),
            polymarket_asset_ids: env_list("POLYMARKET_ASSET_IDS"),
            polymarket_api_key: env_opt("POLYMARKET_API_KEY"),
            kalshi_ws_url: env_or("KALSHI_WS_URL", KALSHI_WS_URL),
            kalshi_tickers: env_list("KALSHI_TICKERS"),
            kalshi_api_key: env_opt("KALSHI_API_KEY"),
            kalshi_private_key_base64: env_opt("KALSHI_PRIVATE_KEY_BASE64"),
            reconnect_base_delay_ms: parse_env("RECONNECT_BASE_DELAY_MS", 1000)?,
            reconnect_max_delay_ms: parse_env("RECONNECT_MAX_DELAY_MS", 30_000)?,

            batch_size: parse_env("BATCH_SIZE", 25)?,
            batch_flush_interval_ms: parse_env("BATCH_FLUSH_INTERVAL_MS", 2000)?,

            arbitrage_poll_interval_ms: parse_env("ARBITRAGE_POLL_INTERVAL_MS", 30_000)?,
            arbitrage_spread_threshold_pct: parse_env("ARBITRAGE_SPREAD_THRESHOLD_PCT", 3.0)?,
            arbitrage_liquidity_threshold_usd: parse_env("ARBITRAGE_LIQUIDITY_THRESHOLD_USD", 500.0)?,

            classifier_concurrency: parse_env("CLASSIFIER_CONCURRENCY", 5)?,
            arbitrage_flag_threshold_pct: parse_env("ARBITRAGE_FLAG_THRESHOLD_PCT", 10.0)?,
            divergence_threshold_pct: parse_env("DIVERGENCE_THRESHOLD_PCT", 5.0)?,
            hub_link_threshold: parse_env("HUB_LINK_THRESHOLD", 3)?,

            scenario_max_depth: parse_env("SCENARIO_MAX_DEPTH", 2)?,
            scenario_min_path_confidence: parse_env("SCENARIO_MIN_PATH_CONFIDENCE", 0.05)?,

            analyst_model_endpoint: env_or(
                "ANALYST_MODEL_ENDPOINT",
                "https://openrouter.ai/api/v1/chat/completions",
            ),
            analyst_model_api_key: env_opt("ANALYST_MODEL_API_KEY"),
            analyst_model_name: env_or("ANALYST_MODEL_NAME", "anthropic/claude-sonnet-4"),

            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| AppError::Config("DATABASE_URL not set".to_string()))?,
            database_service_key: env_opt("DATABASE_SERVICE_KEY"),

            demo_probabilities,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

/// Comma-separated list, empty entries stripped.
fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{key} has an invalid value: {raw:?}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_list_strips_empty_entries() {
        std::env::set_var("TEST_ENV_LIST", "a, b,,c ,");
        assert_eq!(env_list("TEST_ENV_LIST"), vec!["a", "b", "c"]);
        std::env::remove_var("TEST_ENV_LIST");
    }

    #[test]
    fn parse_env_falls_back_to_default() {
        std::env::remove_var("TEST_UNSET_KEY");
        let v: u64 = parse_env("TEST_UNSET_KEY", 42).unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    fn parse_env_rejects_garbage() {
        std::env::set_var("TEST_BAD_PORT", "not-a-number");
        assert!(parse_env::<u16>("TEST_BAD_PORT", 3000).is_err());
        std::env::remove_var("TEST_BAD_PORT");
    }
}
