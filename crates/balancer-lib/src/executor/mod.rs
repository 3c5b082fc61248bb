//! Migration execution
//!
//! Runs approved moves against the platform with bounded concurrency.
//! Moves are started in plan order by a single dispatcher; each one first
//! takes a concurrency permit and then the locks of its source and
//! destination nodes. Cooldowns are written by the dispatcher once results
//! are joined, never by the migration tasks themselves.

mod node_lock;

pub use node_lock::{NodeLockGuard, NodeLocks};

use crate::config::{BalancerConfig, RetryConfig};
use crate::cooldown::CooldownTable;
use crate::error::PlatformError;
use crate::observability::StructuredLogger;
use crate::planner::PlannedMove;
use crate::platform::PlatformClient;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error};

/// Result of one approved move
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MoveOutcome {
    Succeeded { attempts: u32 },
    /// Every attempt failed with a transient error
    TransientExhausted { attempts: u32, error: String },
    PermanentFailure { attempts: u32, error: String },
    /// Not started because shutdown was requested
    Skipped,
    DryRun,
}

impl MoveOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            MoveOutcome::Succeeded { .. } => "succeeded",
            MoveOutcome::TransientExhausted { .. } => "transient_exhausted",
            MoveOutcome::PermanentFailure { .. } => "permanent_failure",
            MoveOutcome::Skipped => "skipped",
            MoveOutcome::DryRun => "dry_run",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, MoveOutcome::Succeeded { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            MoveOutcome::TransientExhausted { .. } | MoveOutcome::PermanentFailure { .. }
        )
    }

    /// Number of platform calls made
    pub fn attempts(&self) -> u32 {
        match self {
            MoveOutcome::Succeeded { attempts }
            | MoveOutcome::TransientExhausted { attempts, .. }
            | MoveOutcome::PermanentFailure { attempts, .. } => *attempts,
            MoveOutcome::Skipped | MoveOutcome::DryRun => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MoveResult {
    #[serde(rename = "move")]
    pub planned: PlannedMove,
    pub outcome: MoveOutcome,
    pub finished_at: DateTime<Utc>,
}

/// Results of executing one batch of approved moves, in plan order
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReport {
    pub results: Vec<MoveResult>,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_failure()).count()
    }

    pub fn skipped(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome == MoveOutcome::Skipped)
            .count()
    }

    /// `(workload, new host)` for every successful move
    pub fn relocations(&self) -> impl Iterator<Item = (&str, &str)> {
        self.results
            .iter()
            .filter(|r| r.outcome.is_success())
            .map(|r| (r.planned.workload.id.as_str(), r.planned.destination.as_str()))
    }
}

/// Everything a migration task needs, cloned into each task
#[derive(Clone)]
struct MigrationContext {
    client: Arc<dyn PlatformClient>,
    retry: RetryConfig,
    timeout: Duration,
    logger: StructuredLogger,
}

/// Executes approved moves against the platform
pub struct Executor {
    context: MigrationContext,
    cooldown: Duration,
    failure_cooldown: Duration,
    concurrency: usize,
    dry_run: bool,
}

impl Executor {
    pub fn new(client: Arc<dyn PlatformClient>, config: &BalancerConfig, logger: StructuredLogger) -> Self {
        Self {
            context: MigrationContext {
                client,
                retry: config.retry.clone(),
                timeout: config.migration_timeout(),
                logger,
            },
            cooldown: config.cooldown(),
            failure_cooldown: config.failure_cooldown(),
            concurrency: config.concurrency.max(1),
            dry_run: config.dry_run,
        }
    }

    /// Override the per-call timeout taken from the configuration
    pub fn with_migration_timeout(mut self, timeout: Duration) -> Self {
        self.context.timeout = timeout;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Execute `approved` in plan order
    ///
    /// Cooldowns are written to `cooldowns` for every move that reached the
    /// platform. Once `shutdown` reads `true`, moves not yet started are
    /// reported as skipped; moves already running finish normally.
    pub async fn execute(
        &self,
        approved: Vec<PlannedMove>,
        cooldowns: &mut CooldownTable,
        locks: &NodeLocks,
        shutdown: &watch::Receiver<bool>,
    ) -> ExecutionReport {
        if self.dry_run {
            return self.dry_run_report(approved);
        }

        let total = approved.len();
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut results: BTreeMap<usize, MoveResult> = BTreeMap::new();
        let mut pending: BTreeMap<usize, PlannedMove> = BTreeMap::new();
        let mut tasks = JoinSet::new();
        let mut queue = approved.into_iter().enumerate();

        while let Some((index, planned)) = queue.next() {
            if *shutdown.borrow() {
                self.skip(index, planned, &mut results);
                for (index, planned) in queue.by_ref() {
                    self.skip(index, planned, &mut results);
                }
                break;
            }

            let permit = match Arc::clone(&permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    self.skip(index, planned, &mut results);
                    continue;
                }
            };
            // Moves start strictly in plan order: while this one waits for a
            // busy node it keeps its permit, and node-disjoint moves behind it
            // wait too.
            if locks.is_locked(&planned.source) || locks.is_locked(&planned.destination) {
                debug!(
                    workload_id = %planned.workload.id,
                    source = %planned.source,
                    destination = %planned.destination,
                    "Waiting for a node busy with another migration"
                );
            }
            let guard = locks.lock_pair(&planned.source, &planned.destination).await;

            // Waiting for locks may have taken a while
            if *shutdown.borrow() {
                drop(guard);
                drop(permit);
                self.skip(index, planned, &mut results);
                for (index, planned) in queue.by_ref() {
                    self.skip(index, planned, &mut results);
                }
                break;
            }

            debug!(
                workload_id = %planned.workload.id,
                source = %planned.source,
                destination = %planned.destination,
                "Starting migration"
            );
            pending.insert(index, planned.clone());
            let context = self.context.clone();
            tasks.spawn(async move {
                let outcome = migrate_with_retry(&context, &planned).await;
                drop(guard);
                drop(permit);
                (index, planned, outcome, Utc::now())
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, planned, outcome, finished_at)) => {
                    pending.remove(&index);
                    self.record(cooldowns, &planned, &outcome, finished_at);
                    results.insert(
                        index,
                        MoveResult {
                            planned,
                            outcome,
                            finished_at,
                        },
                    );
                }
                Err(e) => error!(error = %e, "Migration task failed"),
            }
        }

        // Tasks that panicked never reported; whether the platform acted is unknown
        for (index, planned) in pending {
            let outcome = MoveOutcome::PermanentFailure {
                attempts: 0,
                error: "migration task aborted".to_string(),
            };
            let finished_at = Utc::now();
            self.record(cooldowns, &planned, &outcome, finished_at);
            results.insert(
                index,
                MoveResult {
                    planned,
                    outcome,
                    finished_at,
                },
            );
        }

        debug_assert_eq!(results.len(), total);
        ExecutionReport {
            results: results.into_values().collect(),
        }
    }

    fn dry_run_report(&self, approved: Vec<PlannedMove>) -> ExecutionReport {
        let results = approved
            .into_iter()
            .map(|planned| {
                let outcome = MoveOutcome::DryRun;
                self.context.logger.log_move_executed(&planned, &outcome);
                MoveResult {
                    planned,
                    outcome,
                    finished_at: Utc::now(),
                }
            })
            .collect();
        ExecutionReport { results }
    }

    fn skip(&self, index: usize, planned: PlannedMove, results: &mut BTreeMap<usize, MoveResult>) {
        let outcome = MoveOutcome::Skipped;
        self.context.logger.log_move_executed(&planned, &outcome);
        results.insert(
            index,
            MoveResult {
                planned,
                outcome,
                finished_at: Utc::now(),
            },
        );
    }

    /// Write the cooldown for a finished move and log its outcome
    fn record(
        &self,
        cooldowns: &mut CooldownTable,
        planned: &PlannedMove,
        outcome: &MoveOutcome,
        finished_at: DateTime<Utc>,
    ) {
        let duration = match outcome {
            MoveOutcome::Succeeded { .. } | MoveOutcome::PermanentFailure { .. } => self.cooldown,
            MoveOutcome::TransientExhausted { .. } => self.failure_cooldown,
            MoveOutcome::Skipped | MoveOutcome::DryRun => return,
        };
        cooldowns.set(&planned.workload.id, finished_at, duration);
        self.context.logger.log_move_executed(planned, outcome);
    }
}

/// Call the platform until the move succeeds, fails permanently, or
/// `max_attempts` calls have been made
async fn migrate_with_retry(context: &MigrationContext, planned: &PlannedMove) -> MoveOutcome {
    let max_attempts = context.retry.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = match tokio::time::timeout(
            context.timeout,
            context.client.migrate(&planned.workload, &planned.destination),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PlatformError::Timeout(context.timeout)),
        };

        match result {
            Ok(()) => return MoveOutcome::Succeeded { attempts: attempt },
            Err(e) if !e.is_transient() => {
                return MoveOutcome::PermanentFailure {
                    attempts: attempt,
                    error: e.to_string(),
                }
            }
            Err(e) if attempt >= max_attempts => {
                return MoveOutcome::TransientExhausted {
                    attempts: attempt,
                    error: e.to_string(),
                }
            }
            Err(e) => {
                let delay = context.retry.backoff_after(attempt);
                context
                    .logger
                    .log_move_retry(planned, attempt, delay, &e.to_string());
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests;
