//! Per-workload migration cooldowns
//!
//! The table is owned by the control loop. Only the executor writes to it
//! and only the safety gate reads it.

use crate::models::WorkloadId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// Workload id to earliest time the workload may be migrated again
#[derive(Debug, Clone, Default, Serialize)]
pub struct CooldownTable {
    entries: HashMap<WorkloadId, DateTime<Utc>>,
}

impl CooldownTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `workload` ineligible until `now + duration`
    ///
    /// An existing later deadline is kept.
    pub fn set(&mut self, workload: &str, now: DateTime<Utc>, duration: Duration) {
        let until = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.entries
            .entry(workload.to_string())
            .and_modify(|existing| {
                if until > *existing {
                    *existing = until;
                }
            })
            .or_insert(until);
    }

    pub fn eligible_at(&self, workload: &str) -> Option<DateTime<Utc>> {
        self.entries.get(workload).copied()
    }

    /// Whether the workload is still cooling down at `now`
    pub fn is_cooling(&self, workload: &str, now: DateTime<Utc>) -> bool {
        self.entries.get(workload).is_some_and(|until| *until > now)
    }

    /// Drop entries that have elapsed; returns how many were removed
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, until| *until > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
