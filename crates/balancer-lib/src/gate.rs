//! Safety gate between planning and execution
//!
//! Re-checks every planned move against the cooldown table and a fresh read
//! of node state, since cluster state may have changed while the plan was
//! being computed.

use crate::cooldown::CooldownTable;
use crate::models::{fits, Node, NodeStatus, DIMENSIONS};
use crate::planner::{MigrationPlan, PlannedMove};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Why the gate refused a move
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    /// The workload is still cooling down
    Cooldown { until: DateTime<Utc> },
    /// The destination is missing from the fresh node reading
    DestinationMissing,
    /// The destination left the `active` state
    DestinationNotActive { status: NodeStatus },
    /// The destination no longer has room for the workload
    InsufficientHeadroom,
}

impl RejectReason {
    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            RejectReason::Cooldown { .. } => "cooldown",
            RejectReason::DestinationMissing => "destination_missing",
            RejectReason::DestinationNotActive { .. } => "destination_not_active",
            RejectReason::InsufficientHeadroom => "insufficient_headroom",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Cooldown { until } => write!(f, "cooling down until {}", until.to_rfc3339()),
            RejectReason::DestinationMissing => write!(f, "destination node not found"),
            RejectReason::DestinationNotActive { status } => {
                write!(f, "destination node is {status}")
            }
            RejectReason::InsufficientHeadroom => write!(f, "insufficient headroom on destination"),
        }
    }
}

/// A move the gate refused
#[derive(Debug, Clone, Serialize)]
pub struct RejectedMove {
    #[serde(rename = "move")]
    pub planned: PlannedMove,
    pub reason: RejectReason,
}

/// Result of gating a plan
#[derive(Debug, Clone, Default, Serialize)]
pub struct GateDecision {
    /// Approved moves, in plan order
    pub approved: Vec<PlannedMove>,
    pub rejected: Vec<RejectedMove>,
}

/// Stateless filter over plans
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetyGate;

impl SafetyGate {
    pub fn new() -> Self {
        Self
    }

    /// Split `plan` into approved and rejected moves
    ///
    /// Headroom is taken from `fresh_nodes`, less the footprints of moves
    /// already approved toward the same destination in this pass.
    pub fn filter(
        &self,
        plan: &MigrationPlan,
        cooldowns: &CooldownTable,
        now: DateTime<Utc>,
        fresh_nodes: &[Node],
    ) -> GateDecision {
        let nodes: HashMap<&str, &Node> = fresh_nodes.iter().map(|n| (n.id.as_str(), n)).collect();
        let mut reserved: HashMap<&str, [f64; DIMENSIONS]> = HashMap::new();
        let mut decision = GateDecision::default();

        for planned in &plan.moves {
            match Self::check(planned, cooldowns, now, &nodes, &reserved) {
                Ok(()) => {
                    let slot = reserved
                        .entry(planned.destination.as_str())
                        .or_insert([0.0; DIMENSIONS]);
                    for (r, f) in slot.iter_mut().zip(planned.workload.footprint.as_array()) {
                        *r += f;
                    }
                    decision.approved.push(planned.clone());
                }
                Err(reason) => decision.rejected.push(RejectedMove {
                    planned: planned.clone(),
                    reason,
                }),
            }
        }
        decision
    }

    fn check(
        planned: &PlannedMove,
        cooldowns: &CooldownTable,
        now: DateTime<Utc>,
        nodes: &HashMap<&str, &Node>,
        reserved: &HashMap<&str, [f64; DIMENSIONS]>,
    ) -> Result<(), RejectReason> {
        if cooldowns.is_cooling(planned.workload_id(), now) {
            if let Some(until) = cooldowns.eligible_at(planned.workload_id()) {
                return Err(RejectReason::Cooldown { until });
            }
        }

        let dest = nodes
            .get(planned.destination.as_str())
            .ok_or(RejectReason::DestinationMissing)?;
        if dest.status != NodeStatus::Active {
            return Err(RejectReason::DestinationNotActive { status: dest.status });
        }

        let mut headroom = dest.headroom();
        if let Some(taken) = reserved.get(planned.destination.as_str()) {
            for (h, t) in headroom.iter_mut().zip(taken) {
                *h -= t;
            }
        }
        if !fits(&planned.workload.footprint.as_array(), &headroom) {
            return Err(RejectReason::InsufficientHeadroom);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Movability, Resources, Workload, WorkloadKind};
    use crate::planner::MoveReason;
    use std::time::Duration;

    fn node(id: &str, free_cpu: f64, status: NodeStatus) -> Node {
        Node {
            id: id.to_string(),
            total: Resources::new(16.0, 1000, 0),
            consumed: Resources::new(16.0 - free_cpu, 0, 0),
            status,
        }
    }

    fn planned(workload: &str, destination: &str, cpu: f64) -> PlannedMove {
        PlannedMove {
            workload: Workload {
                id: workload.to_string(),
                name: None,
                kind: WorkloadKind::Vm,
                footprint: Resources::new(cpu, 100, 0),
                host: "a".to_string(),
                movability: Movability::Movable,
            },
            source: "a".to_string(),
            destination: destination.to_string(),
            score_before: 10.0,
            score_after: 5.0,
            reason: MoveReason::Rebalance,
        }
    }

    fn plan(moves: Vec<PlannedMove>) -> MigrationPlan {
        MigrationPlan {
            baseline_score: 10.0,
            final_score: 5.0,
            moves,
        }
    }

    #[test]
    fn test_never_approves_cooling_workload() {
        let now = Utc::now();
        let mut cooldowns = CooldownTable::new();
        cooldowns.set("100", now, Duration::from_secs(300));

        let decision = SafetyGate::new().filter(
            &plan(vec![planned("100", "b", 1.0), planned("101", "b", 1.0)]),
            &cooldowns,
            now,
            &[node("b", 8.0, NodeStatus::Active)],
        );

        assert_eq!(decision.approved.len(), 1);
        assert_eq!(decision.approved[0].workload_id(), "101");
        assert_eq!(decision.rejected.len(), 1);
        assert!(matches!(decision.rejected[0].reason, RejectReason::Cooldown { .. }));
    }

    #[test]
    fn test_elapsed_cooldown_is_approved() {
        let now = Utc::now();
        let mut cooldowns = CooldownTable::new();
        cooldowns.set("100", now - chrono::Duration::seconds(600), Duration::from_secs(300));

        let decision = SafetyGate::new().filter(
            &plan(vec![planned("100", "b", 1.0)]),
            &cooldowns,
            now,
            &[node("b", 8.0, NodeStatus::Active)],
        );
        assert_eq!(decision.approved.len(), 1);
    }

    #[test]
    fn test_rejects_destination_no_longer_active() {
        let decision = SafetyGate::new().filter(
            &plan(vec![planned("100", "b", 1.0), planned("101", "c", 1.0)]),
            &CooldownTable::new(),
            Utc::now(),
            &[node("b", 8.0, NodeStatus::Maintenance)],
        );
        assert!(decision.approved.is_empty());
        assert_eq!(
            decision.rejected[0].reason,
            RejectReason::DestinationNotActive {
                status: NodeStatus::Maintenance
            }
        );
        assert_eq!(decision.rejected[1].reason, RejectReason::DestinationMissing);
    }

    #[test]
    fn test_headroom_accounts_for_earlier_approvals() {
        let decision = SafetyGate::new().filter(
            &plan(vec![
                planned("100", "b", 3.0),
                planned("101", "b", 3.0),
                planned("102", "b", 1.0),
            ]),
            &CooldownTable::new(),
            Utc::now(),
            &[node("b", 4.0, NodeStatus::Active)],
        );

        let approved: Vec<_> = decision.approved.iter().map(|m| m.workload_id().as_str()).collect();
        assert_eq!(approved, vec!["100", "102"]);
        assert_eq!(decision.rejected.len(), 1);
        assert_eq!(decision.rejected[0].reason, RejectReason::InsufficientHeadroom);
    }
}
