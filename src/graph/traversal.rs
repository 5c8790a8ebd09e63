use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::types::{
    AffectedEdge, CausalStep, ImpactDirection, Relationship, RelationshipType, ShockDirection,
};

/// Directed adjacency view over the undirected relationship rows. Each row
/// contributes a half-edge in both directions; neighbor lists are sorted by
/// key so first-reached-wins expansion is reproducible.
pub struct Graph {
    adjacency: HashMap<String, Vec<(String, Arc<Relationship>)>>,
}

impl Graph {
    pub fn build(relationships: &[Relationship]) -> Self {
        let mut adjacency: HashMap<String, Vec<(String, Arc<Relationship>)>> = HashMap::new();
        for rel in relationships {
            let rel = Arc::new(rel.clone());
            adjacency
                .entry(rel.market_key_a.clone())
                .or_default()
                .push((rel.market_key_b.clone(), Arc::clone(&rel)));
            adjacency
                .entry(rel.market_key_b.clone())
                .or_default()
                .push((rel.market_key_a.clone(), rel));
        }
        for edges in adjacency.values_mut() {
            edges.sort_by(|x, y| x.0.cmp(&y.0));
        }
        Self { adjacency }
    }

    pub fn neighbors(&self, key: &str) -> &[(String, Arc<Relationship>)] {
        self.adjacency.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn edge_between(&self, a: &str, b: &str) -> Option<&Relationship> {
        self.neighbors(a)
            .iter()
            .find(|(neighbor, _)| neighbor == b)
            .map(|(_, rel)| rel.as_ref())
    }

    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }
}

/// Direction algebra for one hop.
///
/// equivalent and implied pass the shock through; mutually_exclusive flips
/// it; correlated flips only when the edge's impact direction is negative.
pub fn propagate_direction(
    incoming: ShockDirection,
    relationship_type: RelationshipType,
    impact_direction: ImpactDirection,
) -> ShockDirection {
    match relationship_type {
        RelationshipType::Equivalent | RelationshipType::Implied => incoming,
        RelationshipType::MutuallyExclusive => incoming.flip(),
        RelationshipType::Correlated => {
            if impact_direction == ImpactDirection::Negative {
                incoming.flip()
            } else {
                incoming
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TraversalConfig {
    pub max_depth: u32,
    pub min_path_confidence: f64,
}

/// Bounded breadth-first propagation from the shocked origin.
///
/// Each market expands at most once (first path to reach it wins; BFS plus
/// sorted neighbor order makes that deterministic). Paths whose cumulative
/// confidence decays below the threshold are discarded without expansion.
/// Returned impacts are sorted by cumulative confidence descending.
pub fn traverse(
    graph: &Graph,
    origin: &str,
    direction: ShockDirection,
    cfg: &TraversalConfig,
) -> Vec<CausalStep> {
    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(origin.to_string());

    let mut queue: VecDeque<(String, ShockDirection, u32, Vec<String>, f64)> = VecDeque::new();
    queue.push_back((origin.to_string(), direction, 0, vec![origin.to_string()], 1.0));

    let mut impacts: Vec<CausalStep> = Vec::new();

    while let Some((node, dir, depth, path, cumulative)) = queue.pop_front() {
        if depth >= cfg.max_depth {
            continue;
        }
        for (neighbor, rel) in graph.neighbors(&node) {
            if visited.contains(neighbor) {
                continue;
            }
            let edge_confidence = rel.confidence_score;
            let next_cumulative = cumulative * edge_confidence;
            if next_cumulative < cfg.min_path_confidence {
                continue;
            }

            let next_direction = propagate_direction(dir, rel.relationship_type, rel.impact_direction);
            visited.insert(neighbor.clone());

            let mut next_path = path.clone();
            next_path.push(neighbor.clone());

            impacts.push(CausalStep {
                market_key: neighbor.clone(),
                order: depth + 1,
                relationship_type: rel.relationship_type,
                direction: next_direction,
                cumulative_confidence: next_cumulative,
                edge_confidence,
                path: next_path.clone(),
                logic_justification: rel.logic_justification.clone(),
                vantage_insight: rel.vantage_insight.clone(),
                correlation_strength: rel.correlation_strength,
                logical_layer: rel.logical_layer,
                probability_a: rel.probability_a,
                probability_b: rel.probability_b,
            });

            queue.push_back((neighbor.clone(), next_direction, depth + 1, next_path, next_cumulative));
        }
    }

    impacts.sort_by(|x, y| {
        y.cumulative_confidence
            .partial_cmp(&x.cumulative_confidence)
            .unwrap_or(Ordering::Equal)
    });
    impacts
}

/// Distinct market keys on the union of all impact paths, excluding the
/// shocked origin (it is recorded separately as the trigger).
pub fn affected_nodes(origin: &str, impacts: &[CausalStep]) -> Vec<String> {
    let mut set: BTreeSet<String> = impacts
        .iter()
        .flat_map(|impact| impact.path.iter().cloned())
        .collect();
    set.remove(origin);
    set.into_iter().collect()
}

/// Every consecutive pair on every impact path, deduplicated by directed
/// (source → target) key, with the edge's type, propagated direction and
/// confidence.
pub fn affected_edges(
    graph: &Graph,
    origin_direction: ShockDirection,
    impacts: &[CausalStep],
) -> Vec<AffectedEdge> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut edges = Vec::new();

    for impact in impacts {
        let mut direction = origin_direction;
        for pair in impact.path.windows(2) {
            let (source, target) = (&pair[0], &pair[1]);
            let Some(rel) = graph.edge_between(source, target) else {
                continue;
            };
            direction = propagate_direction(direction, rel.relationship_type, rel.impact_direction);
            if seen.insert((source.clone(), target.clone())) {
                edges.push(AffectedEdge {
                    source: source.clone(),
                    target: target.clone(),
                    relationship_type: rel.relationship_type,
                    direction,
                    confidence: rel.confidence_score,
                });
            }
        }
    }
    edges
}
