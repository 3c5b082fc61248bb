//! Snapshot collection from the platform
//!
//! Node metrics are read with one concurrent request per node; the
//! workload listing runs alongside. Failures on individual nodes only mark
//! those nodes unreachable.

use super::{node_from_reading, ClusterSnapshot, SnapshotPolicy};
use crate::error::{CycleError, PlatformError};
use crate::models::{Node, NodeId};
use crate::platform::{NodeMetrics, PlatformClient};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Raw reading for one node
#[derive(Debug, Clone)]
pub struct NodeReading {
    pub id: NodeId,
    pub online: bool,
    pub metrics: Result<NodeMetrics, PlatformError>,
}

/// Gathers readings from the platform and assembles snapshots
pub struct SnapshotCollector {
    client: Arc<dyn PlatformClient>,
    policy: SnapshotPolicy,
}

impl SnapshotCollector {
    pub fn new(client: Arc<dyn PlatformClient>, policy: SnapshotPolicy) -> Self {
        Self { client, policy }
    }

    /// Collect a full cluster snapshot
    pub async fn collect(&self) -> Result<ClusterSnapshot, CycleError> {
        let start = Instant::now();

        let (node_readings, workloads) =
            tokio::join!(self.collect_node_readings(), self.client.list_workloads());
        let node_readings = node_readings?;
        let workloads = workloads.map_err(CycleError::WorkloadListing)?;

        let snapshot = ClusterSnapshot::assemble(Utc::now(), node_readings, workloads, &self.policy)?;

        debug!(
            nodes = snapshot.node_count(),
            workloads = snapshot.workload_count(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Snapshot collected"
        );
        Ok(snapshot)
    }

    /// Re-read node state only, with the snapshot policy applied
    pub async fn fresh_nodes(&self) -> Result<Vec<Node>, CycleError> {
        let readings = self.collect_node_readings().await?;
        Ok(readings
            .into_iter()
            .filter(|r| self.policy.manages(&r.id))
            .map(|r| node_from_reading(r, &self.policy))
            .collect())
    }

    /// List nodes, then fan out one metrics request per managed online node
    async fn collect_node_readings(&self) -> Result<Vec<NodeReading>, CycleError> {
        let listings = self
            .client
            .list_nodes()
            .await
            .map_err(CycleError::NodeListing)?;

        let mut readings = Vec::with_capacity(listings.len());
        let mut pending = HashSet::new();
        let mut tasks = JoinSet::new();

        for listing in listings {
            if !self.policy.manages(&listing.id) {
                continue;
            }
            if !listing.online {
                readings.push(NodeReading {
                    id: listing.id,
                    online: false,
                    metrics: Err(PlatformError::Unavailable("node reported offline".to_string())),
                });
                continue;
            }

            pending.insert(listing.id.clone());
            let client = Arc::clone(&self.client);
            tasks.spawn(async move {
                let metrics = client.node_metrics(&listing.id).await;
                (listing.id, metrics)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, metrics)) => {
                    pending.remove(&id);
                    readings.push(NodeReading {
                        id,
                        online: true,
                        metrics,
                    });
                }
                Err(e) => warn!(error = %e, "Node metrics task failed"),
            }
        }

        // Tasks that panicked never reported back
        for id in pending {
            readings.push(NodeReading {
                id,
                online: true,
                metrics: Err(PlatformError::Unavailable("metrics task aborted".to_string())),
            });
        }

        Ok(readings)
    }
}
