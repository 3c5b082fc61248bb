//! Virtualization platform access
//!
//! The balancer only talks to the platform through [`PlatformClient`].
//! Transport concerns (authentication, connection reuse, HTTP retries) stay
//! inside the implementation; the core only classifies the errors it gets
//! back as transient or permanent.

pub mod proxmox;

pub use proxmox::{ProxmoxClient, ProxmoxConfig};

use crate::error::PlatformError;
use crate::models::{NodeId, Resources, Workload, WorkloadId, WorkloadKind};
use serde::{Deserialize, Serialize};

pub use async_trait::async_trait;

/// A node as listed by the platform, before its metrics are fetched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeListing {
    pub id: NodeId,
    /// Whether the platform considers the node online
    pub online: bool,
}

/// Capacity and usage readings for one node
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub total: Resources,
    pub consumed: Resources,
}

/// A running workload as reported by the platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadReading {
    pub id: WorkloadId,
    pub name: Option<String>,
    pub kind: WorkloadKind,
    pub host: NodeId,
    pub footprint: Resources,
    /// Pinned on the platform side (e.g. via a tag)
    pub pinned: bool,
}

/// Trait for virtualization platform clients
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// List the cluster's nodes
    async fn list_nodes(&self) -> Result<Vec<NodeListing>, PlatformError>;

    /// Read capacity and usage of a single node
    async fn node_metrics(&self, node: &str) -> Result<NodeMetrics, PlatformError>;

    /// List running workloads with their current host
    async fn list_workloads(&self) -> Result<Vec<WorkloadReading>, PlatformError>;

    /// Live-migrate a workload and wait for the platform to report the result
    async fn migrate(&self, workload: &Workload, destination: &str) -> Result<(), PlatformError>;
}
