use dashmap::DashMap;

/// Microstructure state for one exchange-side asset. Born on the first
/// book/ticker message, overwritten on every update, gone on process exit.
#[derive(Debug, Clone, Default)]
pub struct MicroEntry {
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    /// Sum of price×size over ladder levels within ±2% of mid, both sides.
    pub depth_usd: f64,
    /// Absolute spread in price units, never negative.
    pub spread: Option<f64>,
    pub volume_24h: Option<f64>,
}

impl MicroEntry {
    pub fn mid(&self) -> Option<f64> {
        match (self.best_bid, self.best_ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
            _ => None,
        }
    }

    /// Spread relative to mid, in percentage points.
    pub fn spread_pct(&self) -> Option<f64> {
        let spread = self.spread?;
        let mid = self.mid()?;
        if mid > 0.0 {
            Some(spread / mid * 100.0)
        } else {
            None
        }
    }
}

/// Process-local per-asset cache shared by the two venue sessions.
///
/// Each venue owns a disjoint key space (Polymarket asset ids vs Kalshi
/// tickers), so entries are only ever written by a single session; the map
/// provides the concurrent-read safety the enrichment path needs.
pub struct MicroCache {
    entries: DashMap<String, MicroEntry>,
}

impl MicroCache {
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    /// Apply a full book update: recompute best bid/ask, mid and the
    /// depth-within-2%-of-mid figure. Spread and volume survive from any
    /// earlier ticker update.
    pub fn apply_book(&self, asset_id: &str, bids: &[(f64, f64)], asks: &[(f64, f64)]) {
        let best_bid = bids.iter().map(|&(p, _)| p).fold(f64::NAN, f64::max);
        let best_ask = asks.iter().map(|&(p, _)| p).fold(f64::NAN, f64::min);
        let best_bid = (!best_bid.is_nan()).then_some(best_bid);
        let best_ask = (!best_ask.is_nan()).then_some(best_ask);

        let depth_usd = match (best_bid, best_ask) {
            (Some(bid), Some(ask)) => {
                let mid = (bid + ask) / 2.0;
                depth_within(bids, mid) + depth_within(asks, mid)
            }
            _ => 0.0,
        };

        let mut entry = self.entries.entry(asset_id.to_string()).or_default();
        entry.best_bid = best_bid;
        entry.best_ask = best_ask;
        entry.depth_usd = depth_usd;
        if let (Some(bid), Some(ask)) = (best_bid, best_ask) {
            entry.spread = Some((ask - bid).max(0.0));
        }
    }

    /// Apply a ticker-style update: best bid/ask, spread, optionally 24h volume.
    pub fn apply_ticker(
        &self,
        asset_id: &str,
        best_bid: Option<f64>,
        best_ask: Option<f64>,
        volume_24h: Option<f64>,
    ) {
        let mut entry = self.entries.entry(asset_id.to_string()).or_default();
        if best_bid.is_some() {
            entry.best_bid = best_bid;
        }
        if best_ask.is_some() {
            entry.best_ask = best_ask;
        }
        if let (Some(bid), Some(ask)) = (entry.best_bid, entry.best_ask) {
            entry.spread = Some((ask - bid).max(0.0));
        }
        if volume_24h.is_some() {
            entry.volume_24h = volume_24h;
        }
    }

    pub fn get(&self, asset_id: &str) -> Option<MicroEntry> {
        self.entries.get(asset_id).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MicroCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Sum of price×size over levels within ±2% of mid.
fn depth_within(levels: &[(f64, f64)], mid: f64) -> f64 {
    let band = mid * 0.02;
    levels
        .iter()
        .filter(|&&(p, _)| (p - mid).abs() <= band)
        .map(|&(p, s)| p * s)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn book_computes_best_and_depth() {
        let cache = MicroCache::new();
        cache.apply_book("tok1", &[(0.63, 100.0)], &[(0.65, 100.0)]);

        let e = cache.get("tok1").unwrap();
        assert_eq!(e.best_bid, Some(0.63));
        assert_eq!(e.best_ask, Some(0.65));
        assert!((e.mid().unwrap() - 0.64).abs() < 1e-12);
        // Both levels lie within 2% of mid 0.64: 0.63·100 + 0.65·100 = 128
        assert!((e.depth_usd - 128.0).abs() < 1e-9, "depth={}", e.depth_usd);
    }

    #[test]
    fn levels_outside_band_excluded_from_depth() {
        let cache = MicroCache::new();
        // mid = 0.50, band = ±0.01: the 0.60 ask and 0.40 bid are excluded
        cache.apply_book(
            "tok1",
            &[(0.495, 100.0), (0.40, 1000.0)],
            &[(0.505, 100.0), (0.60, 1000.0)],
        );
        let e = cache.get("tok1").unwrap();
        assert!((e.depth_usd - (0.495 * 100.0 + 0.505 * 100.0)).abs() < 1e-9);
    }

    #[test]
    fn one_sided_book_has_zero_depth() {
        let cache = MicroCache::new();
        cache.apply_book("tok1", &[], &[(0.65, 100.0)]);
        let e = cache.get("tok1").unwrap();
        assert_eq!(e.best_bid, None);
        assert_eq!(e.best_ask, Some(0.65));
        assert_eq!(e.depth_usd, 0.0);
        assert!(e.mid().is_none());
    }

    #[test]
    fn ticker_updates_spread_and_volume() {
        let cache = MicroCache::new();
        cache.apply_ticker("KXBTC-25DEC31", Some(0.62), Some(0.66), Some(12_500.0));
        let e = cache.get("KXBTC-25DEC31").unwrap();
        assert!((e.spread.unwrap() - 0.04).abs() < 1e-12);
        assert_eq!(e.volume_24h, Some(12_500.0));
        // spread_pct = 0.04 / 0.64 * 100
        assert!((e.spread_pct().unwrap() - 6.25).abs() < 1e-9);
    }

    #[test]
    fn ticker_spread_never_negative() {
        let cache = MicroCache::new();
        // crossed quote
        cache.apply_ticker("tok1", Some(0.70), Some(0.60), None);
        let e = cache.get("tok1").unwrap();
        assert_eq!(e.spread, Some(0.0));
    }

    #[test]
    fn book_preserves_ticker_volume() {
        let cache = MicroCache::new();
        cache.apply_ticker("tok1", Some(0.60), Some(0.62), Some(900.0));
        cache.apply_book("tok1", &[(0.61, 50.0)], &[(0.63, 50.0)]);
        let e = cache.get("tok1").unwrap();
        assert_eq!(e.volume_24h, Some(900.0));
        assert_eq!(e.best_ask, Some(0.63));
    }
}
