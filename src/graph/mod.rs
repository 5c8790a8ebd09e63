pub mod classifier;
pub mod traversal;

pub use traversal::{affected_edges, affected_nodes, propagate_direction, traverse, Graph, TraversalConfig};
