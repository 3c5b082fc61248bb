//! Cluster state snapshots
//!
//! A [`ClusterSnapshot`] is an immutable view of every managed node and
//! workload at one instant. Nodes and workloads are keyed by id in sorted
//! maps so everything computed from a snapshot is independent of the order
//! the platform listed them in.

mod collector;

pub use collector::{NodeReading, SnapshotCollector};

use crate::config::BalancerConfig;
use crate::error::CycleError;
use crate::models::{Movability, Node, NodeId, NodeStatus, Workload, WorkloadId};
use crate::platform::WorkloadReading;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

/// Operator-supplied overrides applied while assembling a snapshot
#[derive(Debug, Clone, Default)]
pub struct SnapshotPolicy {
    /// Only these nodes are managed; empty means all
    pub nodes: HashSet<String>,
    pub maintenance_nodes: HashSet<String>,
    pub pinned_workloads: HashSet<String>,
}

impl SnapshotPolicy {
    pub fn from_config(config: &BalancerConfig) -> Self {
        Self {
            nodes: config.nodes.iter().cloned().collect(),
            maintenance_nodes: config.maintenance_nodes.iter().cloned().collect(),
            pinned_workloads: config.pinned_workloads.iter().cloned().collect(),
        }
    }

    /// Whether a node is managed by this daemon
    pub fn manages(&self, node: &str) -> bool {
        self.nodes.is_empty() || self.nodes.contains(node)
    }
}

/// Immutable view of the cluster at one observation instant
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSnapshot {
    observed_at: DateTime<Utc>,
    nodes: BTreeMap<NodeId, Node>,
    workloads: BTreeMap<WorkloadId, Workload>,
}

impl ClusterSnapshot {
    /// Build a snapshot directly from nodes and workloads
    ///
    /// Fails if a workload id appears twice or a workload references a node
    /// that is not part of the snapshot.
    pub fn new(
        observed_at: DateTime<Utc>,
        nodes: impl IntoIterator<Item = Node>,
        workloads: impl IntoIterator<Item = Workload>,
    ) -> Result<Self, CycleError> {
        let mut node_map = BTreeMap::new();
        for node in nodes {
            if node_map.insert(node.id.clone(), node).is_some() {
                return Err(CycleError::InconsistentSnapshot(
                    "node listed twice".to_string(),
                ));
            }
        }

        let mut workload_map = BTreeMap::new();
        for workload in workloads {
            if !node_map.contains_key(&workload.host) {
                return Err(CycleError::InconsistentSnapshot(format!(
                    "workload {} references unknown node {}",
                    workload.id, workload.host
                )));
            }
            let id = workload.id.clone();
            if workload_map.insert(id.clone(), workload).is_some() {
                return Err(CycleError::InconsistentSnapshot(format!(
                    "workload {id} listed more than once"
                )));
            }
        }

        Ok(Self {
            observed_at,
            nodes: node_map,
            workloads: workload_map,
        })
    }

    /// Assemble a snapshot from raw platform readings
    ///
    /// Nodes whose metrics could not be read become `unreachable`; a partial
    /// snapshot is still a valid snapshot.
    pub fn assemble(
        observed_at: DateTime<Utc>,
        node_readings: Vec<NodeReading>,
        workload_readings: Vec<WorkloadReading>,
        policy: &SnapshotPolicy,
    ) -> Result<Self, CycleError> {
        let mut nodes = Vec::with_capacity(node_readings.len());
        let mut duplicate_guard = HashSet::new();

        for reading in node_readings {
            if !policy.manages(&reading.id) {
                continue;
            }
            if !duplicate_guard.insert(reading.id.clone()) {
                return Err(CycleError::InconsistentSnapshot(format!(
                    "node {} listed more than once",
                    reading.id
                )));
            }
            nodes.push(node_from_reading(reading, policy));
        }

        let known: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        let mut workloads = Vec::with_capacity(workload_readings.len());
        for reading in workload_readings {
            if !known.contains(reading.host.as_str()) {
                debug!(
                    workload_id = %reading.id,
                    host = %reading.host,
                    "Ignoring workload on unmanaged node"
                );
                continue;
            }
            let movability = if reading.pinned || policy.pinned_workloads.contains(&reading.id) {
                Movability::Pinned
            } else {
                Movability::Movable
            };
            workloads.push(Workload {
                id: reading.id,
                name: reading.name,
                kind: reading.kind,
                footprint: reading.footprint,
                host: reading.host,
                movability,
            });
        }

        Self::new(observed_at, nodes, workloads)
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    /// Nodes in id order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Workloads in id order
    pub fn workloads(&self) -> impl Iterator<Item = &Workload> {
        self.workloads.values()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn workload(&self, id: &str) -> Option<&Workload> {
        self.workloads.get(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn workload_count(&self) -> usize {
        self.workloads.len()
    }

    pub fn active_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(|n| n.status.is_active())
    }

    pub fn workloads_on<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Workload> + 'a {
        self.workloads.values().filter(move |w| w.host == node)
    }

    /// Derive a new snapshot with the given workloads relocated
    ///
    /// Node consumption is adjusted by each workload's footprint. Unknown
    /// workloads or destinations are skipped.
    pub fn with_relocations<'a>(
        &self,
        relocations: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> ClusterSnapshot {
        let mut next = self.clone();
        for (workload_id, destination) in relocations {
            let Some(workload) = next.workloads.get_mut(workload_id) else {
                continue;
            };
            if workload.host == destination || !next.nodes.contains_key(destination) {
                continue;
            }
            let footprint = workload.footprint;
            let source = std::mem::replace(&mut workload.host, destination.to_string());

            if let Some(node) = next.nodes.get_mut(&source) {
                node.consumed.cpu_cores = (node.consumed.cpu_cores - footprint.cpu_cores).max(0.0);
                node.consumed.memory_bytes = node.consumed.memory_bytes.saturating_sub(footprint.memory_bytes);
                node.consumed.storage_bytes = node.consumed.storage_bytes.saturating_sub(footprint.storage_bytes);
            }
            if let Some(node) = next.nodes.get_mut(destination) {
                node.consumed.cpu_cores += footprint.cpu_cores;
                node.consumed.memory_bytes = node.consumed.memory_bytes.saturating_add(footprint.memory_bytes);
                node.consumed.storage_bytes = node.consumed.storage_bytes.saturating_add(footprint.storage_bytes);
            }
        }
        next
    }
}

fn node_from_reading(reading: NodeReading, policy: &SnapshotPolicy) -> Node {
    let in_maintenance = policy.maintenance_nodes.contains(&reading.id);

    match reading.metrics {
        Ok(metrics) if reading.online => {
            let status = if in_maintenance {
                NodeStatus::Maintenance
            } else {
                NodeStatus::Active
            };
            let consumed = if status.is_active() && !metrics.consumed.fits_within(&metrics.total) {
                debug!(node = %reading.id, "Clamping node consumption to capacity");
                metrics.consumed.clamped_to(&metrics.total)
            } else {
                metrics.consumed
            };
            Node {
                id: reading.id,
                total: metrics.total,
                consumed,
                status,
            }
        }
        Ok(metrics) => Node {
            id: reading.id,
            total: metrics.total,
            consumed: metrics.consumed,
            status: NodeStatus::Unreachable,
        },
        Err(error) => {
            warn!(node = %reading.id, error = %error, "Node metrics unavailable, marking unreachable");
            Node {
                id: reading.id,
                total: Default::default(),
                consumed: Default::default(),
                status: NodeStatus::Unreachable,
            }
        }
    }
}
