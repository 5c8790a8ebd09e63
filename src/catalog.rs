use std::collections::HashMap;

use crate::store::SignalSnapshot;
use crate::types::Market;

/// Where a resolved probability came from. Demo-resolved values force
/// downstream alerts into `simulated` status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceSource {
    Live,
    Demo,
}

/// A market's current probability with its provenance and, for live quotes,
/// the depth recorded alongside the signal.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedProbability {
    pub probability_pct: f64,
    pub liquidity_depth_usd: f64,
    pub source: PriceSource,
}

/// The exchange-side identifier used to look up live quotes for a market.
/// Polymarket's id wins over the Kalshi ticker when both exist; the
/// classifier, the arbitrage scanner and the scenario engine must all agree
/// on this ordering so snapshotted and scanned prices line up.
pub fn preferred_exchange_id(market: &Market) -> Option<&str> {
    market
        .polymarket_asset_id
        .as_deref()
        .or(market.kalshi_ticker.as_deref())
}

/// Read-side view over the catalog, the latest persisted signals and the
/// configured demo fallback table.
pub struct PriceBook<'a> {
    latest: &'a HashMap<String, SignalSnapshot>,
    demo: &'a HashMap<String, f64>,
}

impl<'a> PriceBook<'a> {
    pub fn new(latest: &'a HashMap<String, SignalSnapshot>, demo: &'a HashMap<String, f64>) -> Self {
        Self { latest, demo }
    }

    /// Resolve a market's probability: live quote under the Polymarket id,
    /// else live quote under the Kalshi ticker, else the demo table, else
    /// nothing.
    pub fn resolve(&self, market: &Market) -> Option<ResolvedProbability> {
        for id in [market.polymarket_asset_id.as_deref(), market.kalshi_ticker.as_deref()]
            .into_iter()
            .flatten()
        {
            if let Some(snapshot) = self.latest.get(id) {
                return Some(ResolvedProbability {
                    probability_pct: snapshot.probability_pct,
                    liquidity_depth_usd: snapshot.liquidity_depth_usd,
                    source: PriceSource::Live,
                });
            }
        }
        self.demo.get(&market.market_key).map(|&pct| ResolvedProbability {
            probability_pct: pct,
            liquidity_depth_usd: 0.0,
            source: PriceSource::Demo,
        })
    }

    /// market_key → probability_pct for every catalog entry that resolves.
    pub fn price_map(&self, catalog: &[Market]) -> HashMap<String, f64> {
        catalog
            .iter()
            .filter_map(|m| self.resolve(m).map(|r| (m.market_key.clone(), r.probability_pct)))
            .collect()
    }
}

/// Catalog index by market_key.
pub fn index_by_key(catalog: &[Market]) -> HashMap<&str, &Market> {
    catalog.iter().map(|m| (m.market_key.as_str(), m)).collect()
}

/// exchange-side identifier → display name, used by the ingest sessions to
/// label emitted quotes.
pub fn display_names(catalog: &[Market]) -> HashMap<String, String> {
    let mut names = HashMap::new();
    for market in catalog {
        if let Some(id) = &market.polymarket_asset_id {
            names.insert(id.clone(), market.event_name.clone());
        }
        if let Some(ticker) = &market.kalshi_ticker {
            names.insert(ticker.clone(), market.event_name.clone());
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn market(key: &str, poly: Option<&str>, kalshi: Option<&str>) -> Market {
        Market {
            market_key: key.to_string(),
            event_name: format!("Event {key}"),
            proposition_text: format!("Will {key} happen?"),
            polymarket_asset_id: poly.map(String::from),
            kalshi_ticker: kalshi.map(String::from),
            resolution_date: None,
            settlement_source: None,
        }
    }

    fn snapshot(event_id: &str, pct: f64, depth: f64) -> SignalSnapshot {
        SignalSnapshot {
            event_id: event_id.to_string(),
            platform: "polymarket".to_string(),
            probability_pct: pct,
            liquidity_depth_usd: depth,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn polymarket_id_preferred_over_kalshi_ticker() {
        let m = market("fed-cut", Some("tok1"), Some("KXFED"));
        assert_eq!(preferred_exchange_id(&m), Some("tok1"));

        let mut latest = HashMap::new();
        latest.insert("tok1".to_string(), snapshot("tok1", 62.0, 1200.0));
        latest.insert("KXFED".to_string(), snapshot("KXFED", 58.0, 400.0));
        let demo = HashMap::new();
        let book = PriceBook::new(&latest, &demo);

        let resolved = book.resolve(&m).unwrap();
        assert_eq!(resolved.probability_pct, 62.0);
        assert_eq!(resolved.source, PriceSource::Live);
    }

    #[test]
    fn falls_through_to_kalshi_then_demo() {
        let m = market("fed-cut", Some("tok1"), Some("KXFED"));
        let mut latest = HashMap::new();
        latest.insert("KXFED".to_string(), snapshot("KXFED", 58.0, 400.0));
        let mut demo = HashMap::new();
        demo.insert("fed-cut".to_string(), 50.0);
        let book = PriceBook::new(&latest, &demo);

        // Kalshi quote exists: live wins over demo
        let resolved = book.resolve(&m).unwrap();
        assert_eq!(resolved.probability_pct, 58.0);
        assert_eq!(resolved.source, PriceSource::Live);

        // no live quotes at all: demo fallback
        let empty = HashMap::new();
        let book = PriceBook::new(&empty, &demo);
        let resolved = book.resolve(&m).unwrap();
        assert_eq!(resolved.probability_pct, 50.0);
        assert_eq!(resolved.source, PriceSource::Demo);
    }

    #[test]
    fn unresolvable_market_yields_none() {
        let m = market("obscure", None, Some("KXOBS"));
        let latest = HashMap::new();
        let demo = HashMap::new();
        let book = PriceBook::new(&latest, &demo);
        assert!(book.resolve(&m).is_none());
    }

    #[test]
    fn price_map_skips_unresolvable_entries() {
        let catalog = vec![
            market("a", Some("tok-a"), None),
            market("b", None, None),
        ];
        let mut latest = HashMap::new();
        latest.insert("tok-a".to_string(), snapshot("tok-a", 70.0, 0.0));
        let demo = HashMap::new();
        let book = PriceBook::new(&latest, &demo);

        let map = book.price_map(&catalog);
        assert_eq!(map.len(), 1);
        assert_eq!(map["a"], 70.0);
    }
}
