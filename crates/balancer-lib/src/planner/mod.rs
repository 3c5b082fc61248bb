//! Migration planning
//!
//! Greedy iterative improvement: repeatedly pick the single move that
//! lowers the imbalance score the most, simulate it on a working copy, and
//! stop once no move improves the score by more than the configured
//! threshold or the per-cycle move budget is spent. Each cycle only acts on
//! the residual imbalance left by earlier cycles, which keeps plans short
//! and damps oscillation.
//!
//! When maintenance evacuation is enabled, movable workloads on
//! `maintenance` nodes are moved off first; those moves count against the
//! same budget.

mod working_copy;

use crate::config::BalancerConfig;
use crate::models::{NodeId, NodeStatus, Workload, WorkloadId};
use crate::scorer::ImbalanceScorer;
use crate::snapshot::ClusterSnapshot;
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use tracing::{debug, warn};
use working_copy::WorkingCopy;

/// Why a move was planned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveReason {
    /// Reduces the imbalance score
    Rebalance,
    /// Drains a node in maintenance
    Evacuation,
}

impl fmt::Display for MoveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MoveReason::Rebalance => write!(f, "rebalance"),
            MoveReason::Evacuation => write!(f, "evacuation"),
        }
    }
}

/// A single proposed migration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedMove {
    /// The workload as observed in the snapshot
    pub workload: Workload,
    pub source: NodeId,
    pub destination: NodeId,
    /// Simulated score before this move
    pub score_before: f64,
    /// Simulated score after this move
    pub score_after: f64,
    pub reason: MoveReason,
}

impl PlannedMove {
    pub fn workload_id(&self) -> &WorkloadId {
        &self.workload.id
    }

    /// Expected change of the imbalance score (negative is an improvement)
    pub fn delta(&self) -> f64 {
        self.score_after - self.score_before
    }
}

/// Ordered list of proposed migrations for one cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationPlan {
    pub baseline_score: f64,
    /// Simulated score once every move has been applied
    pub final_score: f64,
    pub moves: Vec<PlannedMove>,
}

impl MigrationPlan {
    pub fn empty(score: f64) -> Self {
        Self {
            baseline_score: score,
            final_score: score,
            moves: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }
}

/// Best candidate found so far in one greedy step
struct Candidate {
    workload: usize,
    destination: usize,
    score: f64,
    reduction: f64,
    cost: u64,
}

/// Produces migration plans from snapshots
#[derive(Debug, Clone)]
pub struct Planner {
    scorer: ImbalanceScorer,
    min_improvement: f64,
    max_moves: usize,
    evacuate_maintenance: bool,
}

impl Planner {
    pub fn new(scorer: ImbalanceScorer, min_improvement: f64, max_moves: usize) -> Self {
        Self {
            scorer,
            min_improvement,
            max_moves,
            evacuate_maintenance: false,
        }
    }

    pub fn from_config(config: &BalancerConfig) -> Self {
        Self {
            scorer: ImbalanceScorer::new(&config.weights),
            min_improvement: config.min_improvement,
            max_moves: config.max_moves_per_cycle,
            evacuate_maintenance: config.evacuate_maintenance,
        }
    }

    pub fn with_evacuation(mut self, enabled: bool) -> Self {
        self.evacuate_maintenance = enabled;
        self
    }

    pub fn scorer(&self) -> &ImbalanceScorer {
        &self.scorer
    }

    /// Compute the migration plan for a snapshot
    pub fn plan(&self, snapshot: &ClusterSnapshot) -> MigrationPlan {
        let baseline = self.scorer.score(snapshot);
        if snapshot.active_nodes().count() < 2 {
            debug!("Fewer than two active nodes, nothing to plan");
            return MigrationPlan::empty(baseline);
        }

        let mut copy = WorkingCopy::new(snapshot);
        let mut current = copy.score(&self.scorer);
        let mut moves = Vec::new();

        if self.evacuate_maintenance {
            self.plan_evacuation(&mut copy, &mut current, &mut moves);
        }

        while moves.len() < self.max_moves {
            let Some(best) = self.best_rebalance_move(&mut copy, current) else {
                break;
            };
            if best.reduction <= 0.0 || best.reduction <= self.min_improvement {
                debug!(
                    best_reduction = best.reduction,
                    min_improvement = self.min_improvement,
                    "No move improves the score enough"
                );
                break;
            }
            moves.push(self.commit(&mut copy, &best, current, MoveReason::Rebalance));
            current = best.score;
        }

        MigrationPlan {
            baseline_score: baseline,
            final_score: current,
            moves,
        }
    }

    /// Best improving move over all movable workloads on active nodes
    fn best_rebalance_move(&self, copy: &mut WorkingCopy<'_>, current: f64) -> Option<Candidate> {
        let mut best: Option<Candidate> = None;

        for w in 0..copy.workloads.len() {
            let (host, planned, movable, cost) = {
                let ww = &copy.workloads[w];
                (ww.host, ww.planned, ww.workload.is_movable(), ww.workload.migration_cost())
            };
            if planned || !movable || copy.nodes[host].status != NodeStatus::Active {
                continue;
            }

            for a in 0..copy.active.len() {
                let dest = copy.active[a];
                if dest == host || !copy.has_headroom(dest, &copy.workloads[w].footprint) {
                    continue;
                }
                let score = copy.score_move(&self.scorer, w, dest);
                let candidate = Candidate {
                    workload: w,
                    destination: dest,
                    score,
                    reduction: current - score,
                    cost,
                };
                let better = match &best {
                    None => true,
                    Some(b) => compare_candidates(&candidate, b, copy) == Ordering::Less,
                };
                if better {
                    best = Some(candidate);
                }
            }
        }
        best
    }

    /// Move movable workloads off maintenance nodes, largest memory first
    fn plan_evacuation(&self, copy: &mut WorkingCopy<'_>, current: &mut f64, moves: &mut Vec<PlannedMove>) {
        let mut evacuees: Vec<usize> = (0..copy.workloads.len())
            .filter(|&w| {
                let ww = &copy.workloads[w];
                ww.workload.is_movable() && copy.nodes[ww.host].status == NodeStatus::Maintenance
            })
            .collect();
        evacuees.sort_by(|&a, &b| {
            let wa = copy.workloads[a].workload;
            let wb = copy.workloads[b].workload;
            wb.footprint
                .memory_bytes
                .cmp(&wa.footprint.memory_bytes)
                .then_with(|| wa.id.cmp(&wb.id))
        });

        for w in evacuees {
            if moves.len() >= self.max_moves {
                break;
            }

            let mut best: Option<Candidate> = None;
            for a in 0..copy.active.len() {
                let dest = copy.active[a];
                if !copy.has_headroom(dest, &copy.workloads[w].footprint) {
                    continue;
                }
                let score = copy.score_move(&self.scorer, w, dest);
                // Destinations are visited in id order, so the first lowest score wins ties
                if best.as_ref().map_or(true, |b| score < b.score) {
                    best = Some(Candidate {
                        workload: w,
                        destination: dest,
                        score,
                        reduction: *current - score,
                        cost: copy.workloads[w].workload.migration_cost(),
                    });
                }
            }

            match best {
                Some(best) => {
                    moves.push(self.commit(copy, &best, *current, MoveReason::Evacuation));
                    *current = best.score;
                }
                None => {
                    let ww = &copy.workloads[w];
                    warn!(
                        workload_id = %ww.workload.id,
                        source = %copy.nodes[ww.host].id,
                        "No active node has room to evacuate workload"
                    );
                }
            }
        }
    }

    fn commit(
        &self,
        copy: &mut WorkingCopy<'_>,
        candidate: &Candidate,
        score_before: f64,
        reason: MoveReason,
    ) -> PlannedMove {
        let source = copy.nodes[copy.workloads[candidate.workload].host].id.clone();
        let destination = copy.nodes[candidate.destination].id.clone();
        let workload = copy.workloads[candidate.workload].workload.clone();

        copy.commit(candidate.workload, candidate.destination);

        debug!(
            workload_id = %workload.id,
            source = %source,
            destination = %destination,
            reason = %reason,
            score_before = score_before,
            score_after = candidate.score,
            "Simulated move"
        );

        PlannedMove {
            workload,
            source,
            destination,
            score_before,
            score_after: candidate.score,
            reason,
        }
    }
}

/// `Less` means `a` is the better candidate
///
/// Larger reduction first, then lower migration cost, then smaller workload
/// id, then smaller destination id.
fn compare_candidates(a: &Candidate, b: &Candidate, copy: &WorkingCopy<'_>) -> Ordering {
    b.reduction
        .total_cmp(&a.reduction)
        .then_with(|| a.cost.cmp(&b.cost))
        .then_with(|| {
            copy.workloads[a.workload]
                .workload
                .id
                .cmp(&copy.workloads[b.workload].workload.id)
        })
        .then_with(|| copy.nodes[a.destination].id.cmp(&copy.nodes[b.destination].id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoringWeights;
    use crate::models::{Movability, Node, Resources, WorkloadKind};
    use chrono::Utc;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn node(id: &str, cpu_used: f64, status: NodeStatus) -> Node {
        Node {
            id: id.to_string(),
            total: Resources::new(100.0, 100 * GIB, 0),
            consumed: Resources::new(cpu_used, 50 * GIB, 0),
            status,
        }
    }

    fn workload(id: &str, host: &str, cpu: f64, mem_gib: u64) -> Workload {
        Workload {
            id: id.to_string(),
            name: None,
            kind: WorkloadKind::Vm,
            footprint: Resources::new(cpu, mem_gib * GIB, 0),
            host: host.to_string(),
            movability: Movability::Movable,
        }
    }

    fn cpu_planner(max_moves: usize) -> Planner {
        Planner::new(
            ImbalanceScorer::new(&ScoringWeights {
                cpu: 1.0,
                memory: 0.0,
                storage: 0.0,
            }),
            1.0,
            max_moves,
        )
    }

    fn snapshot(nodes: Vec<Node>, workloads: Vec<Workload>) -> ClusterSnapshot {
        ClusterSnapshot::new(Utc::now(), nodes, workloads).unwrap()
    }

    #[test]
    fn test_empty_plan_with_fewer_than_two_active_nodes() {
        let planner = cpu_planner(5);
        let s = snapshot(
            vec![
                node("a", 90.0, NodeStatus::Active),
                node("b", 0.0, NodeStatus::Maintenance),
            ],
            vec![workload("100", "a", 20.0, 1)],
        );
        assert!(planner.plan(&s).is_empty());

        let none = snapshot(vec![], vec![]);
        assert!(planner.plan(&none).is_empty());
    }

    #[test]
    fn test_pinned_workloads_are_never_proposed() {
        let planner = cpu_planner(5);
        let mut pinned = workload("100", "a", 20.0, 1);
        pinned.movability = Movability::Pinned;
        let s = snapshot(
            vec![node("a", 90.0, NodeStatus::Active), node("b", 10.0, NodeStatus::Active)],
            vec![pinned, workload("101", "a", 5.0, 1)],
        );

        let plan = planner.plan(&s);
        assert!(!plan.is_empty());
        assert!(plan.moves.iter().all(|m| m.workload_id() != "100"));
    }

    #[test]
    fn test_never_proposes_destination_without_headroom() {
        let planner = cpu_planner(5);
        // b is nearly empty on CPU but cannot take the memory
        let mut b = node("b", 10.0, NodeStatus::Active);
        b.consumed.memory_bytes = 99 * GIB;
        let s = snapshot(
            vec![node("a", 90.0, NodeStatus::Active), b, node("c", 50.0, NodeStatus::Active)],
            vec![workload("100", "a", 20.0, 4)],
        );

        let plan = planner.plan(&s);
        for m in &plan.moves {
            assert_ne!(m.destination, "b");
            let dest = s.node(&m.destination).unwrap();
            assert!(m.workload.footprint.fits_within(&Resources::new(
                dest.total.cpu_cores - dest.consumed.cpu_cores,
                dest.total.memory_bytes - dest.consumed.memory_bytes,
                dest.total.storage_bytes - dest.consumed.storage_bytes,
            )));
        }
    }

    #[test]
    fn test_scores_strictly_decrease() {
        let planner = cpu_planner(10);
        let s = snapshot(
            vec![
                node("a", 95.0, NodeStatus::Active),
                node("b", 5.0, NodeStatus::Active),
                node("c", 60.0, NodeStatus::Active),
            ],
            vec![
                workload("100", "a", 10.0, 1),
                workload("101", "a", 15.0, 2),
                workload("102", "a", 20.0, 4),
                workload("103", "c", 10.0, 1),
                workload("104", "c", 5.0, 1),
            ],
        );

        let plan = planner.plan(&s);
        assert!(plan.len() >= 2);
        let mut previous = plan.baseline_score;
        for m in &plan.moves {
            assert_eq!(m.score_before, previous);
            assert!(m.score_after < m.score_before);
            assert!(m.delta() < 0.0);
            previous = m.score_after;
        }
        assert_eq!(plan.final_score, previous);
        assert!(plan.final_score <= plan.baseline_score);
    }

    #[test]
    fn test_respects_max_moves() {
        let planner = cpu_planner(1);
        let s = snapshot(
            vec![node("a", 95.0, NodeStatus::Active), node("b", 5.0, NodeStatus::Active)],
            vec![
                workload("100", "a", 10.0, 1),
                workload("101", "a", 15.0, 1),
                workload("102", "a", 20.0, 1),
            ],
        );
        assert_eq!(planner.plan(&s).len(), 1);
    }

    #[test]
    fn test_workload_moves_at_most_once_per_plan() {
        let planner = cpu_planner(10);
        let s = snapshot(
            vec![
                node("a", 95.0, NodeStatus::Active),
                node("b", 5.0, NodeStatus::Active),
                node("c", 5.0, NodeStatus::Active),
            ],
            vec![workload("100", "a", 40.0, 1), workload("101", "a", 30.0, 1)],
        );
        let plan = planner.plan(&s);
        let mut ids: Vec<_> = plan.moves.iter().map(|m| m.workload_id().clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), plan.len());
    }

    #[test]
    fn test_tie_break_prefers_cheaper_then_smaller_id() {
        let planner = cpu_planner(1);
        // Three workloads with identical CPU effect; 101 and 102 share the lowest cost
        let s = snapshot(
            vec![node("a", 80.0, NodeStatus::Active), node("b", 20.0, NodeStatus::Active)],
            vec![
                workload("100", "a", 30.0, 8),
                workload("102", "a", 30.0, 2),
                workload("101", "a", 30.0, 2),
            ],
        );
        let plan = planner.plan(&s);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.moves[0].workload_id(), "101");
        assert_eq!(plan.moves[0].destination, "b");
    }

    #[test]
    fn test_tie_break_prefers_smaller_destination() {
        let planner = cpu_planner(1);
        let s = snapshot(
            vec![
                node("a", 90.0, NodeStatus::Active),
                node("c", 10.0, NodeStatus::Active),
                node("b", 10.0, NodeStatus::Active),
            ],
            vec![workload("100", "a", 20.0, 1)],
        );
        let plan = planner.plan(&s);
        assert_eq!(plan.moves[0].destination, "b");
    }

    fn zero_threshold_planner() -> Planner {
        Planner::new(
            ImbalanceScorer::new(&ScoringWeights {
                cpu: 1.0,
                memory: 0.0,
                storage: 0.0,
            }),
            0.0,
            1,
        )
    }

    fn twin_destinations(a: f64, twin: f64, d: f64, footprint: f64) -> ClusterSnapshot {
        snapshot(
            vec![
                node("a", a, NodeStatus::Active),
                node("b", twin, NodeStatus::Active),
                node("c", twin, NodeStatus::Active),
                node("d", d, NodeStatus::Active),
            ],
            vec![workload("100", "a", footprint, 1)],
        )
    }

    #[test]
    fn test_identically_loaded_destinations_resolve_to_smaller_id() {
        let plan = zero_threshold_planner().plan(&twin_destinations(33.3, 7.1, 66.6, 2.9));
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.moves[0].destination, "b");
    }

    #[test]
    fn test_twin_destination_sweep_never_picks_larger_id() {
        let planner = zero_threshold_planner();
        let mut ties = 0;
        for a in [20.0, 33.3, 41.7, 58.9] {
            for twin in [1.3, 7.1, 12.9, 19.4] {
                for d in [66.6, 71.9, 88.8] {
                    for footprint in [0.7, 2.9, 5.3, 9.1] {
                        let plan = planner.plan(&twin_destinations(a, twin, d, footprint));
                        let Some(m) = plan.moves.first() else { continue };
                        if m.destination == "b" || m.destination == "c" {
                            ties += 1;
                            assert_eq!(
                                m.destination, "b",
                                "a={a} twin={twin} d={d} footprint={footprint}"
                            );
                        }
                    }
                }
            }
        }
        assert!(ties > 0);
    }

    #[test]
    fn test_permutation_equivalent_snapshots_give_identical_plans() {
        let planner = Planner::new(ImbalanceScorer::new(&ScoringWeights::default()), 0.5, 10);
        let nodes = vec![
            node("pve1", 88.0, NodeStatus::Active),
            node("pve2", 12.0, NodeStatus::Active),
            node("pve3", 47.0, NodeStatus::Active),
            node("pve4", 61.0, NodeStatus::Active),
        ];
        let workloads = vec![
            workload("100", "pve1", 12.0, 2),
            workload("101", "pve1", 12.0, 2),
            workload("102", "pve1", 7.0, 1),
            workload("103", "pve4", 9.0, 3),
            workload("104", "pve4", 9.0, 3),
            workload("105", "pve3", 4.0, 1),
        ];

        let forward = snapshot(nodes.clone(), workloads.clone());
        let mut rev_nodes = nodes;
        rev_nodes.reverse();
        let mut rev_workloads = workloads;
        rev_workloads.reverse();
        rev_workloads.swap(1, 4);
        let backward = snapshot(rev_nodes, rev_workloads);

        let a = planner.plan(&forward);
        let b = planner.plan(&backward);
        assert!(!a.is_empty());
        assert_eq!(a.moves, b.moves);
        assert_eq!(a.final_score.to_bits(), b.final_score.to_bits());
    }

    #[test]
    fn test_baseline_matches_scorer() {
        let planner = Planner::new(ImbalanceScorer::new(&ScoringWeights::default()), 1.0, 5);
        let s = snapshot(
            vec![node("a", 70.0, NodeStatus::Active), node("b", 30.0, NodeStatus::Active)],
            vec![workload("100", "a", 5.0, 1)],
        );
        let plan = planner.plan(&s);
        assert_eq!(plan.baseline_score.to_bits(), planner.scorer().score(&s).to_bits());
    }

    #[test]
    fn test_evacuation_moves_workloads_off_maintenance_nodes() {
        let planner = cpu_planner(5).with_evacuation(true);
        let s = snapshot(
            vec![
                node("a", 40.0, NodeStatus::Active),
                node("b", 20.0, NodeStatus::Active),
                node("m", 30.0, NodeStatus::Maintenance),
            ],
            vec![workload("200", "m", 10.0, 1), workload("201", "m", 10.0, 8)],
        );

        let plan = planner.plan(&s);
        let evacuations: Vec<_> = plan
            .moves
            .iter()
            .filter(|m| m.reason == MoveReason::Evacuation)
            .collect();
        assert_eq!(evacuations.len(), 2);
        // Largest memory first
        assert_eq!(evacuations[0].workload_id(), "201");
        assert!(evacuations.iter().all(|m| m.source == "m" && m.destination != "m"));
        // First evacuee lands on the least loaded node
        assert_eq!(evacuations[0].destination, "b");
    }

    #[test]
    fn test_evacuation_disabled_leaves_maintenance_workloads() {
        let planner = cpu_planner(5);
        let s = snapshot(
            vec![
                node("a", 40.0, NodeStatus::Active),
                node("b", 40.0, NodeStatus::Active),
                node("m", 30.0, NodeStatus::Maintenance),
            ],
            vec![workload("200", "m", 10.0, 1)],
        );
        assert!(planner.plan(&s).is_empty());
    }
}
