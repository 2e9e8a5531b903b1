//! Node scoring for placement decisions.
//!
//! A node is eligible when the request fits in its free capacity. Among
//! eligible nodes the one left with the most free capacity wins, spreading
//! load; equal scores fall back to the first eligible node by id.

use serde::Serialize;

use strata_entity::schema::Resources;
use strata_entity::EntityId;

use crate::capacity::NodeCapacity;

/// Scored placement result for a single node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeScore {
    pub node: EntityId,
    /// Composite score (higher = better). Range: 0.0..=100.0.
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

/// Individual score components for debugging.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreBreakdown {
    /// Fraction of CPU left free after placement.
    pub free_cpu: f64,
    /// Fraction of memory left free after placement.
    pub free_memory: f64,
}

fn free_fraction(free: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        free as f64 / total as f64
    }
}

/// Score a single node, `None` when the request does not fit.
pub fn score_node(node: &NodeCapacity, request: &Resources) -> Option<NodeScore> {
    let free = node.free();
    if !free.fits(request) {
        return None;
    }
    let after = free.saturating_sub(request);
    let total = node.total();
    let free_cpu = free_fraction(after.cpu_millis, total.cpu_millis);
    let free_memory = free_fraction(after.memory_mb, total.memory_mb);

    Some(NodeScore {
        node: node.id.clone(),
        score: (free_cpu + free_memory) / 2.0 * 100.0,
        breakdown: ScoreBreakdown {
            free_cpu,
            free_memory,
        },
    })
}

/// All eligible nodes, best first. Ties keep snapshot (id) order.
pub fn rank_nodes(nodes: &[NodeCapacity], request: &Resources) -> Vec<NodeScore> {
    let mut scores: Vec<NodeScore> = nodes
        .iter()
        .filter_map(|n| score_node(n, request))
        .collect();
    scores.sort_by(|a, b| b.score.total_cmp(&a.score));
    scores
}

/// The node to place on, if any has room.
pub fn select_node<'a>(nodes: &'a [NodeCapacity], request: &Resources) -> Option<&'a NodeCapacity> {
    let best = rank_nodes(nodes, request).into_iter().next()?;
    nodes.iter().find(|n| n.id == best.node)
}

/// Whether the request could ever fit: some node's total capacity holds it.
pub fn is_satisfiable(nodes: &[NodeCapacity], request: &Resources) -> bool {
    nodes.iter().any(|n| n.total().fits(request))
}
