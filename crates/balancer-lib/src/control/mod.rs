//! Balancing control loop
//!
//! One loop per process. Each cycle walks
//! `Idle → Snapshotting → Planning → Gating → Executing → Sleeping`.
//! An error before `Executing` aborts the cycle without touching the
//! cluster; the loop then sleeps and tries again. Only shutdown ends it.

use crate::config::BalancerConfig;
use crate::cooldown::CooldownTable;
use crate::error::CycleError;
use crate::executor::{ExecutionReport, Executor, NodeLocks};
use crate::gate::{RejectedMove, SafetyGate};
use crate::health::{components, HealthRegistry};
use crate::models::NodeStatus;
use crate::observability::{BalancerMetrics, StructuredLogger};
use crate::planner::{MigrationPlan, Planner};
use crate::platform::PlatformClient;
use crate::scorer::ScoreBreakdown;
use crate::snapshot::{ClusterSnapshot, SnapshotCollector, SnapshotPolicy};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

/// Current phase of the control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleState {
    Idle,
    Snapshotting,
    Planning,
    Gating,
    Executing,
    Sleeping,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CycleState::Idle => "idle",
            CycleState::Snapshotting => "snapshotting",
            CycleState::Planning => "planning",
            CycleState::Gating => "gating",
            CycleState::Executing => "executing",
            CycleState::Sleeping => "sleeping",
        };
        f.write_str(name)
    }
}

/// Why a cycle stopped before execution
#[derive(Debug, Clone, Serialize)]
pub struct CycleFailure {
    pub stage: CycleState,
    pub message: String,
}

/// Summary of one balancing cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    /// Per-dimension imbalance of the snapshot this cycle planned against
    pub imbalance: Option<ScoreBreakdown>,
    pub plan: Option<MigrationPlan>,
    pub rejected: Vec<RejectedMove>,
    pub execution: ExecutionReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<CycleFailure>,
}

impl CycleReport {
    pub fn is_aborted(&self) -> bool {
        self.failure.is_some()
    }

    pub fn approved(&self) -> usize {
        self.execution.results.len()
    }
}

/// Point-in-time view of the loop, served on `/status`
#[derive(Debug, Clone, Serialize)]
pub struct LoopStatus {
    pub state: CycleState,
    pub cycles: u64,
    pub cooldowns: usize,
    pub last_report: Option<CycleReport>,
}

impl Default for LoopStatus {
    fn default() -> Self {
        Self {
            state: CycleState::Idle,
            cycles: 0,
            cooldowns: 0,
            last_report: None,
        }
    }
}

/// Read side of the loop's status, cheap to clone
#[derive(Debug, Clone, Default)]
pub struct StatusHandle {
    inner: Arc<RwLock<LoopStatus>>,
}

impl StatusHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn state(&self) -> CycleState {
        self.inner.read().await.state
    }

    pub async fn last_report(&self) -> Option<CycleReport> {
        self.inner.read().await.last_report.clone()
    }

    pub async fn status(&self) -> LoopStatus {
        self.inner.read().await.clone()
    }

    async fn set_state(&self, state: CycleState) {
        self.inner.write().await.state = state;
    }

    async fn finish_cycle(&self, report: CycleReport, cooldowns: usize) {
        let mut status = self.inner.write().await;
        status.cycles = report.cycle;
        status.cooldowns = cooldowns;
        status.last_report = Some(report);
    }
}

/// The balancing control loop
///
/// Owns the cooldown table and the node locks; the gate reads the former
/// and the executor writes both.
pub struct ControlLoop {
    collector: SnapshotCollector,
    planner: Planner,
    gate: SafetyGate,
    executor: Executor,
    cooldowns: CooldownTable,
    locks: NodeLocks,
    interval: Duration,
    status: StatusHandle,
    health: HealthRegistry,
    metrics: BalancerMetrics,
    logger: StructuredLogger,
    last_known_good: Option<ClusterSnapshot>,
    cycle: u64,
}

impl ControlLoop {
    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn cooldowns(&self) -> &CooldownTable {
        &self.cooldowns
    }

    /// Latest snapshot, with this cycle's successful migrations applied
    pub fn last_known_good(&self) -> Option<&ClusterSnapshot> {
        self.last_known_good.as_ref()
    }

    /// Run cycles until `shutdown` reads `true`
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            dry_run = self.executor.is_dry_run(),
            "Starting control loop"
        );

        while !*shutdown.borrow() {
            self.run_cycle(&shutdown).await;

            self.status.set_state(CycleState::Sleeping).await;
            if sleep_or_shutdown(self.interval, &mut shutdown).await {
                break;
            }
            self.status.set_state(CycleState::Idle).await;
        }

        self.status.set_state(CycleState::Idle).await;
        info!(cycles = self.cycle, "Control loop stopped");
    }

    /// Run exactly one cycle and return its report
    pub async fn run_cycle(&mut self, shutdown: &watch::Receiver<bool>) -> CycleReport {
        self.cycle += 1;
        let cycle = self.cycle;
        let started_at = Utc::now();
        let start = Instant::now();

        self.metrics.inc_cycles();
        self.logger.log_cycle_started(cycle);
        self.status.set_state(CycleState::Idle).await;

        let mut report = CycleReport {
            cycle,
            started_at,
            finished_at: started_at,
            dry_run: self.executor.is_dry_run(),
            imbalance: None,
            plan: None,
            rejected: Vec::new(),
            execution: ExecutionReport::default(),
            failure: None,
        };

        if let Err((stage, error)) = self.drive(&mut report, shutdown).await {
            self.metrics.inc_cycle_errors(&stage.to_string());
            self.logger
                .log_cycle_aborted(cycle, &stage.to_string(), &error.to_string());
            self.record_failure_health(&error).await;
            report.failure = Some(CycleFailure {
                stage,
                message: error.to_string(),
            });
        }

        let elapsed = start.elapsed();
        report.finished_at = Utc::now();
        self.metrics.observe_cycle_duration(elapsed);
        self.metrics.set_cooldown_entries(self.cooldowns.len());
        self.logger.log_cycle_finished(
            cycle,
            elapsed,
            report.plan.as_ref().map_or(0, |p| p.len()),
            report.approved(),
            report.execution.succeeded(),
            report.execution.failed(),
        );

        self.status
            .finish_cycle(report.clone(), self.cooldowns.len())
            .await;
        self.health.set_ready(true).await;
        report
    }

    /// The cycle body; errors carry the state they happened in
    async fn drive(
        &mut self,
        report: &mut CycleReport,
        shutdown: &watch::Receiver<bool>,
    ) -> std::result::Result<(), (CycleState, CycleError)> {
        self.status.set_state(CycleState::Snapshotting).await;
        let snapshot = self
            .collector
            .collect()
            .await
            .map_err(|e| (CycleState::Snapshotting, e))?;
        self.record_snapshot_health(&snapshot).await;
        self.last_known_good = Some(snapshot.clone());

        self.status.set_state(CycleState::Planning).await;
        let planner = &self.planner;
        let (breakdown, plan) = guard_stage(CycleState::Planning, || {
            (planner.scorer().breakdown(&snapshot), planner.plan(&snapshot))
        })?;
        if !plan.baseline_score.is_finite() || !plan.final_score.is_finite() {
            return Err((
                CycleState::Planning,
                CycleError::Planning(format!(
                    "non-finite imbalance score (baseline {}, planned {})",
                    plan.baseline_score, plan.final_score
                )),
            ));
        }
        self.health.set_healthy(components::PLANNER).await;
        self.metrics
            .set_imbalance_scores(plan.baseline_score, plan.final_score);
        self.metrics.add_moves_planned(plan.len());
        self.logger
            .log_imbalance(report.cycle, &breakdown, plan.final_score);
        for planned in &plan.moves {
            self.logger.log_move_proposed(planned);
        }
        report.imbalance = Some(breakdown);
        report.plan = Some(plan.clone());

        if plan.is_empty() {
            debug!(cycle = report.cycle, "Cluster balanced, nothing to do");
            return Ok(());
        }

        self.status.set_state(CycleState::Gating).await;
        let now = Utc::now();
        let pruned = self.cooldowns.prune(now);
        if pruned > 0 {
            debug!(pruned = pruned, "Pruned elapsed cooldowns");
        }
        let fresh_nodes = self.collector.fresh_nodes().await.map_err(|e| {
            (
                CycleState::Gating,
                CycleError::Gating(format!("node re-read failed: {e}")),
            )
        })?;
        let (gate, cooldowns) = (&self.gate, &self.cooldowns);
        let decision = guard_stage(CycleState::Gating, || {
            gate.filter(&plan, cooldowns, now, &fresh_nodes)
        })?;
        self.metrics.add_moves_approved(decision.approved.len());
        for planned in &decision.approved {
            self.logger.log_move_approved(planned);
        }
        for rejected in &decision.rejected {
            self.metrics.inc_move_rejected(&rejected.reason);
            self.logger.log_move_rejected(&rejected.planned, &rejected.reason);
        }
        report.rejected = decision.rejected;

        if decision.approved.is_empty() {
            return Ok(());
        }

        self.status.set_state(CycleState::Executing).await;
        let execution = self
            .executor
            .execute(decision.approved, &mut self.cooldowns, &self.locks, shutdown)
            .await;
        for result in &execution.results {
            self.metrics.inc_migration(&result.outcome);
        }
        if execution.failed() > 0 {
            self.health
                .set_degraded(
                    components::EXECUTOR,
                    format!("{} migration(s) failed in cycle {}", execution.failed(), report.cycle),
                )
                .await;
        } else {
            self.health.set_healthy(components::EXECUTOR).await;
        }

        self.last_known_good = Some(snapshot.with_relocations(execution.relocations()));
        report.execution = execution;
        Ok(())
    }

    async fn record_snapshot_health(&self, snapshot: &ClusterSnapshot) {
        let mut active = 0;
        let mut maintenance = 0;
        let mut unreachable = 0;
        for node in snapshot.nodes() {
            match node.status {
                NodeStatus::Active => active += 1,
                NodeStatus::Maintenance => maintenance += 1,
                NodeStatus::Unreachable => unreachable += 1,
            }
        }
        self.metrics.set_nodes(active, maintenance, unreachable);

        self.health.set_healthy(components::PLATFORM).await;
        if unreachable > 0 {
            self.health
                .set_degraded(
                    components::SNAPSHOT,
                    format!("{unreachable} node(s) unreachable"),
                )
                .await;
        } else {
            self.health.set_healthy(components::SNAPSHOT).await;
        }
    }

    async fn record_failure_health(&self, error: &CycleError) {
        match error {
            CycleError::NodeListing(_) | CycleError::WorkloadListing(_) => {
                self.health
                    .set_unhealthy(components::PLATFORM, error.to_string())
                    .await;
                self.health
                    .set_unhealthy(components::SNAPSHOT, error.to_string())
                    .await;
            }
            CycleError::InconsistentSnapshot(_) => {
                self.health
                    .set_unhealthy(components::SNAPSHOT, error.to_string())
                    .await;
            }
            CycleError::Planning(_) => {
                self.health
                    .set_unhealthy(components::PLANNER, error.to_string())
                    .await;
            }
            CycleError::Gating(_) => {
                self.health
                    .set_degraded(components::PLATFORM, error.to_string())
                    .await;
            }
        }
    }
}

/// Run a synchronous decision stage, turning a panic into a cycle abort
fn guard_stage<T>(
    stage: CycleState,
    f: impl FnOnce() -> T,
) -> std::result::Result<T, (CycleState, CycleError)> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let message = format!("{stage} panicked: {}", panic_message(payload.as_ref()));
        let error = match stage {
            CycleState::Gating => CycleError::Gating(message),
            _ => CycleError::Planning(message),
        };
        (stage, error)
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Sleep for `interval`; returns true if shutdown was requested meanwhile
async fn sleep_or_shutdown(interval: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let sleep = tokio::time::sleep(interval);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    // Sender gone, nobody can request shutdown anymore
                    (&mut sleep).await;
                    return false;
                }
                if *shutdown.borrow() {
                    return true;
                }
            }
        }
    }
}

/// Builder for the control loop
pub struct ControlLoopBuilder {
    client: Option<Arc<dyn PlatformClient>>,
    config: BalancerConfig,
    health: Option<HealthRegistry>,
    status: Option<StatusHandle>,
    logger: StructuredLogger,
}

impl ControlLoopBuilder {
    pub fn new() -> Self {
        Self {
            client: None,
            config: BalancerConfig::default(),
            health: None,
            status: None,
            logger: StructuredLogger::default(),
        }
    }

    pub fn client(mut self, client: Arc<dyn PlatformClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn config(mut self, config: BalancerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Share an existing status handle (e.g. one already given to the HTTP server)
    pub fn status(mut self, status: StatusHandle) -> Self {
        self.status = Some(status);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.config.dry_run = dry_run;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval_secs = interval.as_secs().max(1);
        self
    }

    /// Validate the configuration and assemble the loop
    pub fn build(self) -> Result<ControlLoop> {
        let client = self
            .client
            .ok_or_else(|| anyhow::anyhow!("Platform client is required"))?;
        self.config.validate()?;

        let collector = SnapshotCollector::new(Arc::clone(&client), SnapshotPolicy::from_config(&self.config));
        let executor = Executor::new(client, &self.config, self.logger.clone());

        Ok(ControlLoop {
            collector,
            planner: Planner::from_config(&self.config),
            gate: SafetyGate::new(),
            executor,
            cooldowns: CooldownTable::new(),
            locks: NodeLocks::new(),
            interval: self.config.interval(),
            status: self.status.unwrap_or_default(),
            health: self.health.unwrap_or_default(),
            metrics: BalancerMetrics::new(),
            logger: self.logger,
            last_known_good: None,
            cycle: 0,
        })
    }
}

impl Default for ControlLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}
