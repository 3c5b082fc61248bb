//! Imbalance scoring
//!
//! The score is a weighted sum, over resource dimensions, of the population
//! variance of node utilization (in percent) across active nodes:
//!
//! ```text
//! score = Σ_d  w_d · Σ_{i<j} (u_i − u_j)² / n²
//! ```
//!
//! The pairwise form is exactly zero when all utilizations are equal. It is
//! summed over the utilizations in ascending order, so the score depends only
//! on the set of values and not on which node holds which: two placements
//! that differ by swapping identically loaded nodes score bit-identically.
//! Nodes with zero capacity in a dimension do not take part in that
//! dimension's variance.

use crate::config::ScoringWeights;
use crate::models::{Dimension, Node, DIMENSIONS};
use crate::snapshot::ClusterSnapshot;
use serde::Serialize;

/// Capacity and usage of one active node, dense per dimension
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeLoad {
    pub total: [f64; DIMENSIONS],
    pub consumed: [f64; DIMENSIONS],
}

impl NodeLoad {
    pub fn from_node(node: &Node) -> Self {
        Self {
            total: node.total.as_array(),
            consumed: node.consumed.as_array(),
        }
    }

    /// Utilization in percent, `None` when the node has no capacity in `dim`
    pub fn utilization(&self, dim: usize) -> Option<f64> {
        utilization(self.consumed[dim], self.total[dim])
    }
}

/// Utilization in percent, `None` for zero capacity
pub fn utilization(consumed: f64, total: f64) -> Option<f64> {
    if total > 0.0 {
        Some(consumed / total * 100.0)
    } else {
        None
    }
}

/// Population variance via pairwise differences; `None` entries are skipped
pub fn pairwise_variance(values: &[Option<f64>]) -> f64 {
    let mut sorted: Vec<f64> = values.iter().flatten().copied().collect();
    if sorted.len() < 2 {
        return 0.0;
    }
    sorted.sort_unstable_by(f64::total_cmp);

    let mut sum = 0.0;
    for (i, a) in sorted.iter().enumerate() {
        for b in &sorted[i + 1..] {
            let d = b - a;
            sum += d * d;
        }
    }
    let n = sorted.len() as f64;
    sum / (n * n)
}

/// Per-dimension detail of a score, for logging and the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ScoreBreakdown {
    pub total: f64,
    pub cpu_variance: f64,
    pub memory_variance: f64,
    pub storage_variance: f64,
    pub active_nodes: usize,
}

/// Computes the imbalance score of a cluster placement
#[derive(Debug, Clone)]
pub struct ImbalanceScorer {
    weights: [f64; DIMENSIONS],
}

impl ImbalanceScorer {
    pub fn new(weights: &ScoringWeights) -> Self {
        Self {
            weights: weights.as_array(),
        }
    }

    pub fn weight(&self, dimension: Dimension) -> f64 {
        self.weights[dimension.index()]
    }

    /// Score of a snapshot; always non-negative
    pub fn score(&self, snapshot: &ClusterSnapshot) -> f64 {
        self.score_loads(&Self::active_loads(snapshot))
    }

    /// Score of a set of active node loads
    pub fn score_loads(&self, loads: &[NodeLoad]) -> f64 {
        let mut scratch = Vec::with_capacity(loads.len());
        self.variances(loads, &mut scratch)
            .iter()
            .zip(self.weights.iter())
            .map(|(variance, weight)| variance * weight)
            .sum()
    }

    /// Score of the given per-dimension utilizations (same layout as [`Self::score_loads`])
    pub fn score_utilizations(&self, utilizations: &[Vec<Option<f64>>; DIMENSIONS]) -> f64 {
        let mut score = 0.0;
        for dim in 0..DIMENSIONS {
            if self.weights[dim] == 0.0 {
                continue;
            }
            score += self.weights[dim] * pairwise_variance(&utilizations[dim]);
        }
        score
    }

    pub fn breakdown(&self, snapshot: &ClusterSnapshot) -> ScoreBreakdown {
        let loads = Self::active_loads(snapshot);
        let mut scratch = Vec::with_capacity(loads.len());
        let variances = self.variances(&loads, &mut scratch);
        ScoreBreakdown {
            total: self.score_loads(&loads),
            cpu_variance: variances[Dimension::Cpu.index()],
            memory_variance: variances[Dimension::Memory.index()],
            storage_variance: variances[Dimension::Storage.index()],
            active_nodes: loads.len(),
        }
    }

    fn active_loads(snapshot: &ClusterSnapshot) -> Vec<NodeLoad> {
        snapshot.active_nodes().map(NodeLoad::from_node).collect()
    }

    fn variances(&self, loads: &[NodeLoad], scratch: &mut Vec<Option<f64>>) -> [f64; DIMENSIONS] {
        let mut out = [0.0; DIMENSIONS];
        for (dim, slot) in out.iter_mut().enumerate() {
            if self.weights[dim] == 0.0 {
                continue;
            }
            scratch.clear();
            scratch.extend(loads.iter().map(|l| l.utilization(dim)));
            *slot = pairwise_variance(scratch);
        }
        out
    }
}
