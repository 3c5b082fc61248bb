//! Core data models for the balancer

use serde::{Deserialize, Serialize};
use std::fmt;

/// Node identifier (hypervisor host name)
pub type NodeId = String;

/// Workload identifier (VM/CT id as a string)
pub type WorkloadId = String;

/// Number of resource dimensions tracked per node and workload
pub const DIMENSIONS: usize = 3;

/// A resource dimension the balancer scores and checks headroom on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Cpu,
    Memory,
    Storage,
}

impl Dimension {
    pub const ALL: [Dimension; DIMENSIONS] = [Dimension::Cpu, Dimension::Memory, Dimension::Storage];

    pub fn index(self) -> usize {
        match self {
            Dimension::Cpu => 0,
            Dimension::Memory => 1,
            Dimension::Storage => 2,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Cpu => write!(f, "cpu"),
            Dimension::Memory => write!(f, "memory"),
            Dimension::Storage => write!(f, "storage"),
        }
    }
}

/// Amount of each resource dimension
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu_cores: f64,
    pub memory_bytes: u64,
    pub storage_bytes: u64,
}

impl Resources {
    pub fn new(cpu_cores: f64, memory_bytes: u64, storage_bytes: u64) -> Self {
        Self {
            cpu_cores,
            memory_bytes,
            storage_bytes,
        }
    }

    /// Dense view in [`Dimension::index`] order, used by the scorer and planner
    pub fn as_array(&self) -> [f64; DIMENSIONS] {
        [
            self.cpu_cores,
            self.memory_bytes as f64,
            self.storage_bytes as f64,
        ]
    }

    pub fn get(&self, dimension: Dimension) -> f64 {
        self.as_array()[dimension.index()]
    }

    /// Per-dimension minimum of `self` and `cap`
    pub fn clamped_to(&self, cap: &Resources) -> Resources {
        Resources {
            cpu_cores: self.cpu_cores.min(cap.cpu_cores),
            memory_bytes: self.memory_bytes.min(cap.memory_bytes),
            storage_bytes: self.storage_bytes.min(cap.storage_bytes),
        }
    }

    /// Returns true if every dimension of `self` is at most `other`
    pub fn fits_within(&self, other: &Resources) -> bool {
        fits(&self.as_array(), &other.as_array())
    }
}

/// Returns true if `need` is at most `available` in every dimension
pub fn fits(need: &[f64; DIMENSIONS], available: &[f64; DIMENSIONS]) -> bool {
    need.iter().zip(available.iter()).all(|(n, a)| n <= a)
}

/// Operational status of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Active,
    Maintenance,
    Unreachable,
}

impl NodeStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, NodeStatus::Active)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Active => write!(f, "active"),
            NodeStatus::Maintenance => write!(f, "maintenance"),
            NodeStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// A hypervisor host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub total: Resources,
    pub consumed: Resources,
    pub status: NodeStatus,
}

impl Node {
    /// Capacity left per dimension, never negative
    pub fn headroom(&self) -> [f64; DIMENSIONS] {
        let total = self.total.as_array();
        let consumed = self.consumed.as_array();
        let mut headroom = [0.0; DIMENSIONS];
        for i in 0..DIMENSIONS {
            headroom[i] = (total[i] - consumed[i]).max(0.0);
        }
        headroom
    }
}

/// Kind of workload, which decides the migration endpoint on the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    Vm,
    Container,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadKind::Vm => write!(f, "vm"),
            WorkloadKind::Container => write!(f, "container"),
        }
    }
}

/// Whether the balancer may move a workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Movability {
    Movable,
    Pinned,
}

/// A VM or container running on exactly one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub id: WorkloadId,
    pub name: Option<String>,
    pub kind: WorkloadKind,
    pub footprint: Resources,
    pub host: NodeId,
    pub movability: Movability,
}

impl Workload {
    pub fn is_movable(&self) -> bool {
        self.movability == Movability::Movable
    }

    /// Estimated cost of live-migrating this workload, proportional to memory
    pub fn migration_cost(&self) -> u64 {
        self.footprint.memory_bytes
    }
}
