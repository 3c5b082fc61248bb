//! Error taxonomy
//!
//! - [`PlatformError`]: a single platform call failed; classified as transient or permanent
//! - [`CycleError`]: the current cycle cannot continue; the control loop skips to sleeping
//! - [`ConfigError`]: configuration rejected at startup; the daemon refuses to start

use crate::models::{NodeId, WorkloadId};
use thiserror::Error;

/// Failure reported by (or while talking to) the virtualization platform
#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    #[error("platform call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("resource busy: {0}")]
    Busy(String),

    #[error("platform unavailable: {0}")]
    Unavailable(String),

    #[error("migration rejected: {0}")]
    Rejected(String),

    #[error("workload not found: {0}")]
    WorkloadNotFound(WorkloadId),

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("unexpected platform response: {0}")]
    InvalidResponse(String),
}

impl PlatformError {
    /// Transient failures are worth retrying; everything else is permanent for the move
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PlatformError::Timeout(_) | PlatformError::Busy(_) | PlatformError::Unavailable(_)
        )
    }
}

/// Error that aborts the current cycle before any migration is issued
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("failed to list nodes: {0}")]
    NodeListing(#[source] PlatformError),

    #[error("failed to list workloads: {0}")]
    WorkloadListing(#[source] PlatformError),

    #[error("inconsistent snapshot: {0}")]
    InconsistentSnapshot(String),

    #[error("planning failed: {0}")]
    Planning(String),

    #[error("gating failed: {0}")]
    Gating(String),
}

/// Configuration rejected during startup validation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
