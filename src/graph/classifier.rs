use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::analyst::{extract_object, AnalystClient};
use crate::catalog::PriceBook;
use crate::config::Config;
use crate::error::Result;
use crate::store::Store;
use crate::types::{
    canonical_pair, CorrelationStrength, ImpactDirection, LogicalLayer, Market, Relationship,
    RelationshipType,
};

pub const VENUE_DIVERGENCE: &str = "venue_divergence";
pub const HIGH_VALUE_ARBITRAGE: &str = "high_value_arbitrage";

const SYSTEM_PROMPT: &str = "\
You are a prediction-market relationship analyst. You are given two markets \
with their current probabilities. Reason through three dimensions before \
classifying:\n\
1. Temporal hierarchy — which market resolves first, and whether it can serve \
as a leading indicator for the other.\n\
2. Conditionality — if market A resolves YES, does that materially raise or \
lower P(B=YES), and with what sign.\n\
3. Synthetic arbitrage — whether this pair is one side of a triangle \
constraint where a third market must close the probability sum.\n\
Then respond with a single JSON object and nothing else:\n\
{\"relationship_type\": \"equivalent|implied|mutually_exclusive|correlated\", \
\"confidence_score\": 0.0-1.0, \
\"logic_justification\": \"two or three sentences\", \
\"impact_direction\": \"positive|negative|neutral\", \
\"correlation_strength\": \"low|medium|high|extreme\", \
\"logical_layer\": \"financial|political|statistical|direct\", \
\"vantage_insight\": \"one short headline\"}";

/// Model output shape for one classified pair. Enum-ish fields arrive as
/// free text and are parsed tolerantly afterwards.
#[derive(Debug, Deserialize)]
pub struct ClassifiedPayload {
    pub relationship_type: String,
    pub confidence_score: f64,
    pub logic_justification: String,
    #[serde(default)]
    pub impact_direction: Option<String>,
    #[serde(default)]
    pub correlation_strength: Option<String>,
    #[serde(default)]
    pub logical_layer: Option<String>,
    #[serde(default)]
    pub vantage_insight: Option<String>,
}

/// Turn a model payload into a relationship row with canonical key order and
/// snapshotted probabilities. Returns None when the type is unusable.
pub fn build_relationship(
    key_a: &str,
    key_b: &str,
    payload: ClassifiedPayload,
    probability_a: Option<f64>,
    probability_b: Option<f64>,
) -> Option<Relationship> {
    let relationship_type = RelationshipType::parse(&payload.relationship_type)?;
    let (canonical_a, canonical_b) = canonical_pair(key_a, key_b);
    // keep the snapshots aligned with the canonical key order
    let (probability_a, probability_b) = if canonical_a == key_a {
        (probability_a, probability_b)
    } else {
        (probability_b, probability_a)
    };

    Some(Relationship {
        market_key_a: canonical_a.to_string(),
        market_key_b: canonical_b.to_string(),
        relationship_type,
        confidence_score: payload.confidence_score.clamp(0.0, 1.0),
        logic_justification: payload.logic_justification,
        impact_direction: payload
            .impact_direction
            .as_deref()
            .and_then(ImpactDirection::parse)
            .unwrap_or(ImpactDirection::Neutral),
        correlation_strength: payload
            .correlation_strength
            .as_deref()
            .and_then(CorrelationStrength::parse)
            .unwrap_or(CorrelationStrength::Low),
        logical_layer: payload
            .logical_layer
            .as_deref()
            .and_then(LogicalLayer::parse)
            .unwrap_or(LogicalLayer::Direct),
        vantage_insight: payload.vantage_insight.unwrap_or_default(),
        probability_a,
        probability_b,
        probability_spread: None,
        arbitrage_flag: None,
        risk_alert: None,
    })
}

/// Derived tags computed after classification, when both probability
/// snapshots are present.
///
/// equivalent: spread = |a − b|; divergence alert above the divergence
/// threshold, arbitrage flag above the flag threshold.
/// mutually_exclusive: deviation = |(a + b) − 100|; arbitrage flag above the
/// flag threshold.
pub fn post_process(rel: &mut Relationship, divergence_threshold_pct: f64, flag_threshold_pct: f64) {
    let (Some(a), Some(b)) = (rel.probability_a, rel.probability_b) else {
        return;
    };

    match rel.relationship_type {
        RelationshipType::Equivalent => {
            let spread = (a - b).abs();
            rel.probability_spread = Some(spread);
            if spread > divergence_threshold_pct {
                rel.risk_alert = Some(VENUE_DIVERGENCE.to_string());
            }
            if spread > flag_threshold_pct {
                rel.arbitrage_flag = Some(HIGH_VALUE_ARBITRAGE.to_string());
                rel.logic_justification.push_str(&format!(
                    " Venue prices currently diverge by {spread:.1} percentage points on the same outcome."
                ));
            }
        }
        RelationshipType::MutuallyExclusive => {
            let deviation = ((a + b) - 100.0).abs();
            rel.probability_spread = Some(deviation);
            if deviation > flag_threshold_pct {
                rel.arbitrage_flag = Some(HIGH_VALUE_ARBITRAGE.to_string());
                rel.logic_justification.push_str(&format!(
                    " Combined probability misses 100% by {deviation:.1} percentage points."
                ));
            }
        }
        _ => {}
    }
}

/// Markets carrying strictly more than `threshold` implied + correlated
/// edges, for dashboard highlighting.
pub fn detect_hubs(relationships: &[Relationship], threshold: usize) -> Vec<(String, usize)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for rel in relationships {
        if matches!(
            rel.relationship_type,
            RelationshipType::Implied | RelationshipType::Correlated
        ) {
            *counts.entry(rel.market_key_a.as_str()).or_default() += 1;
            *counts.entry(rel.market_key_b.as_str()).or_default() += 1;
        }
    }
    let mut hubs: Vec<(String, usize)> = counts
        .into_iter()
        .filter(|&(_, n)| n > threshold)
        .map(|(k, n)| (k.to_string(), n))
        .collect();
    hubs.sort_by(|x, y| y.1.cmp(&x.1).then_with(|| x.0.cmp(&y.0)));
    hubs
}

#[derive(Debug, Default)]
pub struct ClassifierSummary {
    pub pairs_total: usize,
    pub classified: usize,
    pub skipped: usize,
    pub hub_nodes: Vec<(String, usize)>,
}

/// One-shot pairwise classification workflow. Designed to be re-run on
/// catalog change: the upsert on the canonical pair key makes repeat runs
/// idempotent over an unchanged catalog.
pub struct Classifier {
    store: Store,
    analyst: Arc<AnalystClient>,
    cfg: Config,
}

impl Classifier {
    pub fn new(store: Store, analyst: Arc<AnalystClient>, cfg: Config) -> Self {
        Self { store, analyst, cfg }
    }

    pub async fn run(&self) -> Result<ClassifierSummary> {
        let catalog = self.store.fetch_catalog().await?;
        let latest = self.store.latest_signals().await?;
        let book = PriceBook::new(&latest, &self.cfg.demo_probabilities);
        let price_map = book.price_map(&catalog);

        let mut summary = ClassifierSummary::default();
        let semaphore = Arc::new(Semaphore::new(self.cfg.classifier_concurrency.max(1)));
        let mut tasks: JoinSet<bool> = JoinSet::new();

        for i in 0..catalog.len() {
            for j in (i + 1)..catalog.len() {
                summary.pairs_total += 1;
                let market_a = catalog[i].clone();
                let market_b = catalog[j].clone();
                let prob_a = price_map.get(&market_a.market_key).copied();
                let prob_b = price_map.get(&market_b.market_key).copied();
                let analyst = Arc::clone(&self.analyst);
                let store = self.store.clone();
                let semaphore = Arc::clone(&semaphore);
                let divergence_threshold = self.cfg.divergence_threshold_pct;
                let flag_threshold = self.cfg.arbitrage_flag_threshold_pct;

                tasks.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return false;
                    };
                    match classify_pair(&analyst, &market_a, &market_b, prob_a, prob_b).await {
                        Ok(Some(mut rel)) => {
                            post_process(&mut rel, divergence_threshold, flag_threshold);
                            match store.upsert_relationship(&rel).await {
                                Ok(()) => true,
                                Err(e) => {
                                    warn!(
                                        pair = %format!("{}|{}", rel.market_key_a, rel.market_key_b),
                                        "failed to store relationship: {e}"
                                    );
                                    false
                                }
                            }
                        }
                        Ok(None) => {
                            warn!(
                                pair = %format!("{}|{}", market_a.market_key, market_b.market_key),
                                "model returned an unusable relationship type, pair skipped"
                            );
                            false
                        }
                        Err(e) => {
                            warn!(
                                pair = %format!("{}|{}", market_a.market_key, market_b.market_key),
                                "classification failed, pair skipped: {e}"
                            );
                            false
                        }
                    }
                });
            }
        }

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(true) => summary.classified += 1,
                Ok(false) => summary.skipped += 1,
                Err(e) => {
                    warn!("classification task panicked: {e}");
                    summary.skipped += 1;
                }
            }
        }

        let stored = self.store.fetch_relationships().await?;
        summary.hub_nodes = detect_hubs(&stored, self.cfg.hub_link_threshold);
        for (key, links) in &summary.hub_nodes {
            info!(market_key = %key, links, "hub node detected");
        }
        info!(
            pairs = summary.pairs_total,
            classified = summary.classified,
            skipped = summary.skipped,
            hubs = summary.hub_nodes.len(),
            "classification run complete"
        );
        Ok(summary)
    }
}

async fn classify_pair(
    analyst: &AnalystClient,
    market_a: &Market,
    market_b: &Market,
    prob_a: Option<f64>,
    prob_b: Option<f64>,
) -> Result<Option<Relationship>> {
    let user = serde_json::json!({
        "market_a": {
            "market_key": market_a.market_key,
            "event_name": market_a.event_name,
            "proposition": market_a.proposition_text,
            "current_probability_pct": prob_a,
        },
        "market_b": {
            "market_key": market_b.market_key,
            "event_name": market_b.event_name,
            "proposition": market_b.proposition_text,
            "current_probability_pct": prob_b,
        },
    })
    .to_string();

    let completion = analyst.complete(SYSTEM_PROMPT, &user).await?;
    let payload: ClassifiedPayload = extract_object(&completion)?;
    Ok(build_relationship(
        &market_a.market_key,
        &market_b.market_key,
        payload,
        prob_a,
        prob_b,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(relationship_type: &str) -> ClassifiedPayload {
        ClassifiedPayload {
            relationship_type: relationship_type.to_string(),
            confidence_score: 0.8,
            logic_justification: "Both resolve on the same Fed decision.".to_string(),
            impact_direction: Some("positive".to_string()),
            correlation_strength: Some("high".to_string()),
            logical_layer: Some("financial".to_string()),
            vantage_insight: Some("Same event, two venues".to_string()),
        }
    }

    #[test]
    fn keys_stored_in_canonical_order_with_aligned_probabilities() {
        let rel = build_relationship("zeta-market", "alpha-market", payload("equivalent"), Some(90.0), Some(20.0))
            .unwrap();
        assert_eq!(rel.market_key_a, "alpha-market");
        assert_eq!(rel.market_key_b, "zeta-market");
        // probabilities follow the swap
        assert_eq!(rel.probability_a, Some(20.0));
        assert_eq!(rel.probability_b, Some(90.0));
    }

    #[test]
    fn confidence_clamped_into_unit_interval() {
        let mut p = payload("correlated");
        p.confidence_score = 1.7;
        let rel = build_relationship("a", "b", p, None, None).unwrap();
        assert_eq!(rel.confidence_score, 1.0);
    }

    #[test]
    fn unusable_type_skips_pair() {
        assert!(build_relationship("a", "b", payload("causal???"), None, None).is_none());
    }

    #[test]
    fn divergent_equivalent_pair_gets_both_tags() {
        let mut rel =
            build_relationship("a", "b", payload("equivalent"), Some(90.0), Some(20.0)).unwrap();
        let before = rel.logic_justification.clone();
        post_process(&mut rel, 5.0, 10.0);

        assert_eq!(rel.probability_spread, Some(70.0));
        assert_eq!(rel.risk_alert.as_deref(), Some(VENUE_DIVERGENCE));
        assert_eq!(rel.arbitrage_flag.as_deref(), Some(HIGH_VALUE_ARBITRAGE));
        assert!(rel.logic_justification.starts_with(&before));
        assert!(rel.logic_justification.contains("70.0 percentage points"));
    }

    #[test]
    fn mild_divergence_alerts_without_flag() {
        let mut rel =
            build_relationship("a", "b", payload("equivalent"), Some(60.0), Some(53.0)).unwrap();
        post_process(&mut rel, 5.0, 10.0);
        assert_eq!(rel.probability_spread, Some(7.0));
        assert_eq!(rel.risk_alert.as_deref(), Some(VENUE_DIVERGENCE));
        assert_eq!(rel.arbitrage_flag, None);
    }

    #[test]
    fn mutually_exclusive_uses_sum_deviation() {
        let mut rel =
            build_relationship("a", "b", payload("mutually_exclusive"), Some(70.0), Some(45.0)).unwrap();
        post_process(&mut rel, 5.0, 10.0);
        // 70 + 45 = 115 → deviation 15 > 10
        assert_eq!(rel.probability_spread, Some(15.0));
        assert_eq!(rel.arbitrage_flag.as_deref(), Some(HIGH_VALUE_ARBITRAGE));
        assert!(rel.logic_justification.contains("15.0 percentage points"));
    }

    #[test]
    fn missing_probability_leaves_row_untagged() {
        let mut rel = build_relationship("a", "b", payload("equivalent"), Some(90.0), None).unwrap();
        post_process(&mut rel, 5.0, 10.0);
        assert_eq!(rel.probability_spread, None);
        assert_eq!(rel.risk_alert, None);
        assert_eq!(rel.arbitrage_flag, None);
    }

    #[test]
    fn correlated_pairs_are_not_tagged() {
        let mut rel =
            build_relationship("a", "b", payload("correlated"), Some(90.0), Some(20.0)).unwrap();
        post_process(&mut rel, 5.0, 10.0);
        assert_eq!(rel.probability_spread, None);
        assert_eq!(rel.arbitrage_flag, None);
    }

    #[test]
    fn hub_detection_counts_implied_and_correlated_only() {
        let mk = |a: &str, b: &str, t: RelationshipType| {
            build_relationship(
                a,
                b,
                ClassifiedPayload {
                    relationship_type: t.to_string(),
                    confidence_score: 0.5,
                    logic_justification: String::new(),
                    impact_direction: None,
                    correlation_strength: None,
                    logical_layer: None,
                    vantage_insight: None,
                },
                None,
                None,
            )
            .unwrap()
        };

        let rels = vec![
            mk("hub", "m1", RelationshipType::Implied),
            mk("hub", "m2", RelationshipType::Correlated),
            mk("hub", "m3", RelationshipType::Implied),
            mk("hub", "m4", RelationshipType::Correlated),
            // equivalent edges never count toward hub status
            mk("hub", "m5", RelationshipType::Equivalent),
            mk("m1", "m2", RelationshipType::Correlated),
        ];

        let hubs = detect_hubs(&rels, 3);
        assert_eq!(hubs, vec![("hub".to_string(), 4)]);
    }
}
