//! Index-based scratch state for plan search
//!
//! Nodes and workloads are laid out in id order. Candidate moves are scored
//! by substituting the two affected utilizations into a scratch buffer, so
//! evaluating a candidate never mutates the committed state; only
//! [`WorkingCopy::commit`] changes consumption.

use crate::models::{fits, NodeId, NodeStatus, Workload, DIMENSIONS};
use crate::scorer::{utilization, ImbalanceScorer};
use crate::snapshot::ClusterSnapshot;

pub(super) struct WorkingNode {
    pub id: NodeId,
    pub status: NodeStatus,
    pub total: [f64; DIMENSIONS],
    pub consumed: [f64; DIMENSIONS],
    /// Position among active nodes, if active
    pub slot: Option<usize>,
}

pub(super) struct WorkingWorkload<'a> {
    pub workload: &'a Workload,
    pub footprint: [f64; DIMENSIONS],
    pub host: usize,
    /// Already part of the plan being built
    pub planned: bool,
}

pub(super) struct WorkingCopy<'a> {
    pub nodes: Vec<WorkingNode>,
    pub workloads: Vec<WorkingWorkload<'a>>,
    /// Node indices of active nodes, in id order
    pub active: Vec<usize>,
    utilizations: [Vec<Option<f64>>; DIMENSIONS],
    scratch: [Vec<Option<f64>>; DIMENSIONS],
}

impl<'a> WorkingCopy<'a> {
    pub fn new(snapshot: &'a ClusterSnapshot) -> Self {
        let mut nodes = Vec::with_capacity(snapshot.node_count());
        let mut active = Vec::new();
        for (idx, node) in snapshot.nodes().enumerate() {
            let slot = if node.status.is_active() {
                active.push(idx);
                Some(active.len() - 1)
            } else {
                None
            };
            nodes.push(WorkingNode {
                id: node.id.clone(),
                status: node.status,
                total: node.total.as_array(),
                consumed: node.consumed.as_array(),
                slot,
            });
        }

        let workloads = snapshot
            .workloads()
            .filter_map(|workload| {
                let host = nodes.iter().position(|n| n.id == workload.host)?;
                Some(WorkingWorkload {
                    workload,
                    footprint: workload.footprint.as_array(),
                    host,
                    planned: false,
                })
            })
            .collect();

        let mut copy = Self {
            nodes,
            workloads,
            active,
            utilizations: Default::default(),
            scratch: Default::default(),
        };
        copy.rebuild_utilizations();
        copy
    }

    fn rebuild_utilizations(&mut self) {
        for dim in 0..DIMENSIONS {
            self.utilizations[dim] = self
                .active
                .iter()
                .map(|&idx| utilization(self.nodes[idx].consumed[dim], self.nodes[idx].total[dim]))
                .collect();
        }
        self.scratch = self.utilizations.clone();
    }

    pub fn score(&self, scorer: &ImbalanceScorer) -> f64 {
        scorer.score_utilizations(&self.utilizations)
    }

    /// Whether `dest` can take `footprint` without exceeding capacity
    pub fn has_headroom(&self, dest: usize, footprint: &[f64; DIMENSIONS]) -> bool {
        let node = &self.nodes[dest];
        let mut headroom = [0.0; DIMENSIONS];
        for dim in 0..DIMENSIONS {
            headroom[dim] = node.total[dim] - node.consumed[dim];
        }
        fits(footprint, &headroom)
    }

    /// Score the placement that would result from moving workload `w` to `dest`
    pub fn score_move(&mut self, scorer: &ImbalanceScorer, w: usize, dest: usize) -> f64 {
        let footprint = self.workloads[w].footprint;
        let source = self.workloads[w].host;
        let (src_after, dst_after) = self.consumption_after(source, dest, &footprint);

        let src_slot = self.nodes[source].slot;
        let dst_slot = self.nodes[dest].slot;
        for dim in 0..DIMENSIONS {
            if let Some(slot) = src_slot {
                self.scratch[dim][slot] = utilization(src_after[dim], self.nodes[source].total[dim]);
            }
            if let Some(slot) = dst_slot {
                self.scratch[dim][slot] = utilization(dst_after[dim], self.nodes[dest].total[dim]);
            }
        }

        let score = scorer.score_utilizations(&self.scratch);

        for dim in 0..DIMENSIONS {
            if let Some(slot) = src_slot {
                self.scratch[dim][slot] = self.utilizations[dim][slot];
            }
            if let Some(slot) = dst_slot {
                self.scratch[dim][slot] = self.utilizations[dim][slot];
            }
        }
        score
    }

    /// Apply a move to the working state
    pub fn commit(&mut self, w: usize, dest: usize) {
        let footprint = self.workloads[w].footprint;
        let source = self.workloads[w].host;
        let (src_after, dst_after) = self.consumption_after(source, dest, &footprint);

        self.nodes[source].consumed = src_after;
        self.nodes[dest].consumed = dst_after;
        self.workloads[w].host = dest;
        self.workloads[w].planned = true;

        for idx in [source, dest] {
            if let Some(slot) = self.nodes[idx].slot {
                for dim in 0..DIMENSIONS {
                    let u = utilization(self.nodes[idx].consumed[dim], self.nodes[idx].total[dim]);
                    self.utilizations[dim][slot] = u;
                    self.scratch[dim][slot] = u;
                }
            }
        }
    }

    fn consumption_after(
        &self,
        source: usize,
        dest: usize,
        footprint: &[f64; DIMENSIONS],
    ) -> ([f64; DIMENSIONS], [f64; DIMENSIONS]) {
        let mut src = self.nodes[source].consumed;
        let mut dst = self.nodes[dest].consumed;
        for dim in 0..DIMENSIONS {
            src[dim] = (src[dim] - footprint[dim]).max(0.0);
            dst[dim] += footprint[dim];
        }
        (src, dst)
    }
}
