use chrono::Utc;
use uuid::Uuid;

use crate::micro::MicroEntry;
use crate::types::{NormalizedQuote, Platform, Price, Side, LOW_CONFIDENCE};

/// Quote quality score in [0,100].
///
/// Depth contributes up to 60 points on a log10 scale ($1000 ≈ 30); spread
/// contributes up to 40, losing 2 points per percentage point of spread.
/// An unknown spread scores the neutral 20.
pub fn confidence_score(depth_usd: f64, spread_pct: Option<f64>) -> f64 {
    let depth_component = if depth_usd > 0.0 {
        (depth_usd.log10() * 10.0).clamp(0.0, 60.0)
    } else {
        0.0
    };
    let spread_component = match spread_pct {
        Some(s) => (40.0 - s * 2.0).max(0.0),
        None => 20.0,
    };
    (depth_component + spread_component).clamp(0.0, 100.0).round()
}

pub fn confidence_flag(score: f64) -> Option<&'static str> {
    (score < 50.0).then_some(LOW_CONFIDENCE)
}

/// Assemble a normalized quote, enriching from the asset's microstructure
/// entry when one exists.
#[allow(clippy::too_many_arguments)]
pub fn build_quote(
    platform: Platform,
    event_id: &str,
    proposition_name: &str,
    price: Price,
    side: Side,
    size: f64,
    micro: Option<&MicroEntry>,
    raw_payload: String,
) -> NormalizedQuote {
    let depth_usd = micro.map(|m| m.depth_usd).unwrap_or(0.0);
    let spread_pct = micro.and_then(|m| m.spread_pct());
    let volume_24h = micro.and_then(|m| m.volume_24h);
    let score = confidence_score(depth_usd, spread_pct);

    NormalizedQuote {
        id: Uuid::new_v4(),
        timestamp: Utc::now(),
        platform,
        event_id: event_id.to_string(),
        proposition_name: proposition_name.to_string(),
        price,
        side,
        size: size.max(0.0),
        probability_pct: price.pct(),
        liquidity_depth_usd: depth_usd,
        bid_ask_spread_pct: spread_pct,
        volume_24h,
        confidence_flag: confidence_flag(score),
        raw_payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::micro::MicroCache;

    #[test]
    fn zero_depth_scores_zero_depth_component() {
        // depth 0, spread unknown: 0 + 20 = 20
        assert_eq!(confidence_score(0.0, None), 20.0);
    }

    #[test]
    fn unknown_spread_scores_neutral_twenty() {
        // depth 1000 → 30, spread unknown → 20
        assert_eq!(confidence_score(1000.0, None), 50.0);
    }

    #[test]
    fn depth_component_caps_at_sixty() {
        // 10^7 dollars → raw 70, capped at 60; spread 0 → 40
        assert_eq!(confidence_score(10_000_000.0, Some(0.0)), 100.0);
    }

    #[test]
    fn wide_spread_zeroes_spread_component() {
        // spread 25 pct → 40 − 50 < 0 → 0
        assert_eq!(confidence_score(1000.0, Some(25.0)), 30.0);
    }

    #[test]
    fn sub_dollar_depth_does_not_go_negative() {
        // log10(0.5) < 0 must clamp to 0, not subtract
        assert_eq!(confidence_score(0.5, None), 20.0);
    }

    #[test]
    fn flag_iff_strictly_below_fifty() {
        assert_eq!(confidence_flag(49.0), Some(LOW_CONFIDENCE));
        assert_eq!(confidence_flag(50.0), None);
        assert_eq!(confidence_flag(100.0), None);
    }

    #[test]
    fn enriched_quote_matches_book_state() {
        // Book: bid 0.63×100, ask 0.65×100 → mid 0.64, depth 128, spread 0.02
        let cache = MicroCache::new();
        cache.apply_book("tok1", &[(0.63, 100.0)], &[(0.65, 100.0)]);
        let micro = cache.get("tok1").unwrap();

        let q = build_quote(
            Platform::Polymarket,
            "tok1",
            "Fed cuts rates in December",
            Price::from_raw(micro.mid().unwrap()),
            Side::Buy,
            50.0,
            Some(&micro),
            "{}".to_string(),
        );

        assert!((q.price.value() - 0.64).abs() < 1e-12);
        assert!((q.probability_pct.value() - 64.0).abs() < 1e-12);
        assert!((q.liquidity_depth_usd - 128.0).abs() < 1e-9);
        // spread_pct = 0.02 / 0.64 × 100 = 3.125
        assert!((q.bid_ask_spread_pct.unwrap() - 3.125).abs() < 1e-9);
        // depth 128 → ≈21.07, spread 3.125 → 33.75, total ≈55 → not low confidence
        assert_eq!(q.confidence_flag, None);
    }

    #[test]
    fn bare_quote_is_low_confidence() {
        let q = build_quote(
            Platform::Kalshi,
            "KXFED-25DEC",
            "Fed cuts rates in December",
            Price::from_cents(62),
            Side::Sell,
            3.0,
            None,
            "{}".to_string(),
        );
        // no micro entry: depth 0 + neutral 20 = 20 < 50
        assert_eq!(q.confidence_flag, Some(LOW_CONFIDENCE));
        assert_eq!(q.liquidity_depth_usd, 0.0);
        assert_eq!(q.bid_ask_spread_pct, None);
    }
}
