//! Observability for the balancer
//!
//! Provides:
//! - Prometheus metrics (cycle counts and latency, imbalance score, move and migration outcomes)
//! - Structured JSON logging with tracing, one `event` name per domain event

use crate::executor::MoveOutcome;
use crate::gate::RejectReason;
use crate::planner::PlannedMove;
use crate::scorer::ScoreBreakdown;
use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, GaugeVec, Histogram, IntCounter, IntCounterVec,
    IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Buckets for cycle duration (in seconds); cycles include live migrations
const CYCLE_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0,
];

static GLOBAL_METRICS: OnceLock<BalancerMetricsInner> = OnceLock::new();

struct BalancerMetricsInner {
    cycles: IntCounter,
    cycle_errors: IntCounterVec,
    cycle_duration_seconds: Histogram,
    imbalance_score: GaugeVec,
    moves_planned: IntCounter,
    moves_approved: IntCounter,
    moves_rejected: IntCounterVec,
    migrations: IntCounterVec,
    cooldown_entries: IntGauge,
    nodes: IntGaugeVec,
}

impl BalancerMetricsInner {
    fn new() -> Self {
        Self {
            cycles: register_int_counter!(
                "proxlb_cycles_total",
                "Number of balancing cycles started"
            )
            .expect("Failed to register cycles_total"),

            cycle_errors: register_int_counter_vec!(
                "proxlb_cycle_errors_total",
                "Number of cycles aborted before execution, by stage",
                &["stage"]
            )
            .expect("Failed to register cycle_errors_total"),

            cycle_duration_seconds: register_histogram!(
                "proxlb_cycle_duration_seconds",
                "Wall time of a full balancing cycle",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_duration_seconds"),

            imbalance_score: register_gauge_vec!(
                "proxlb_imbalance_score",
                "Imbalance score of the last cycle (baseline and simulated after the plan)",
                &["phase"]
            )
            .expect("Failed to register imbalance_score"),

            moves_planned: register_int_counter!(
                "proxlb_moves_planned_total",
                "Number of moves proposed by the planner"
            )
            .expect("Failed to register moves_planned_total"),

            moves_approved: register_int_counter!(
                "proxlb_moves_approved_total",
                "Number of moves approved by the safety gate"
            )
            .expect("Failed to register moves_approved_total"),

            moves_rejected: register_int_counter_vec!(
                "proxlb_moves_rejected_total",
                "Number of moves rejected by the safety gate, by reason",
                &["reason"]
            )
            .expect("Failed to register moves_rejected_total"),

            migrations: register_int_counter_vec!(
                "proxlb_migrations_total",
                "Migration results, by outcome",
                &["outcome"]
            )
            .expect("Failed to register migrations_total"),

            cooldown_entries: register_int_gauge!(
                "proxlb_cooldown_entries",
                "Workloads currently cooling down"
            )
            .expect("Failed to register cooldown_entries"),

            nodes: register_int_gauge_vec!(
                "proxlb_nodes",
                "Nodes in the last snapshot, by status",
                &["status"]
            )
            .expect("Failed to register nodes"),
        }
    }
}

/// Handle to the process-wide balancer metrics
///
/// Clones share the same underlying collectors.
#[derive(Clone)]
pub struct BalancerMetrics {
    _private: (),
}

impl Default for BalancerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BalancerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(BalancerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &BalancerMetricsInner {
        GLOBAL_METRICS.get_or_init(BalancerMetricsInner::new)
    }

    pub fn inc_cycles(&self) {
        self.inner().cycles.inc();
    }

    pub fn inc_cycle_errors(&self, stage: &str) {
        self.inner().cycle_errors.with_label_values(&[stage]).inc();
    }

    pub fn observe_cycle_duration(&self, duration: Duration) {
        self.inner().cycle_duration_seconds.observe(duration.as_secs_f64());
    }

    pub fn set_imbalance_scores(&self, baseline: f64, planned: f64) {
        let gauge = &self.inner().imbalance_score;
        gauge.with_label_values(&["baseline"]).set(baseline);
        gauge.with_label_values(&["planned"]).set(planned);
    }

    pub fn add_moves_planned(&self, count: usize) {
        self.inner().moves_planned.inc_by(count as u64);
    }

    pub fn add_moves_approved(&self, count: usize) {
        self.inner().moves_approved.inc_by(count as u64);
    }

    pub fn inc_move_rejected(&self, reason: &RejectReason) {
        self.inner()
            .moves_rejected
            .with_label_values(&[reason.kind()])
            .inc();
    }

    pub fn inc_migration(&self, outcome: &MoveOutcome) {
        self.inner()
            .migrations
            .with_label_values(&[outcome.label()])
            .inc();
    }

    pub fn set_cooldown_entries(&self, count: usize) {
        self.inner().cooldown_entries.set(count as i64);
    }

    pub fn set_nodes(&self, active: usize, maintenance: usize, unreachable: usize) {
        let gauge = &self.inner().nodes;
        gauge.with_label_values(&["active"]).set(active as i64);
        gauge.with_label_values(&["maintenance"]).set(maintenance as i64);
        gauge.with_label_values(&["unreachable"]).set(unreachable as i64);
    }
}

/// Structured logger for balancer events
///
/// Every line carries `event` and `cluster` fields so JSON logs can be
/// filtered without parsing messages.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    cluster: String,
}

impl Default for StructuredLogger {
    fn default() -> Self {
        Self::new("default")
    }
}

impl StructuredLogger {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
        }
    }

    pub fn log_cycle_started(&self, cycle: u64) {
        info!(
            event = "cycle_started",
            cluster = %self.cluster,
            cycle = cycle,
            "Balancing cycle started"
        );
    }

    pub fn log_cycle_finished(
        &self,
        cycle: u64,
        elapsed: Duration,
        planned: usize,
        approved: usize,
        succeeded: usize,
        failed: usize,
    ) {
        info!(
            event = "cycle_finished",
            cluster = %self.cluster,
            cycle = cycle,
            elapsed_ms = elapsed.as_millis() as u64,
            planned = planned,
            approved = approved,
            succeeded = succeeded,
            failed = failed,
            "Balancing cycle finished"
        );
    }

    pub fn log_cycle_aborted(&self, cycle: u64, stage: &str, error: &str) {
        warn!(
            event = "cycle_aborted",
            cluster = %self.cluster,
            cycle = cycle,
            stage = %stage,
            error = %error,
            "Balancing cycle aborted, no migrations issued"
        );
    }

    pub fn log_imbalance(&self, cycle: u64, baseline: &ScoreBreakdown, planned: f64) {
        info!(
            event = "imbalance_scored",
            cluster = %self.cluster,
            cycle = cycle,
            score_before = baseline.total,
            score_after = planned,
            cpu_variance = baseline.cpu_variance,
            memory_variance = baseline.memory_variance,
            storage_variance = baseline.storage_variance,
            active_nodes = baseline.active_nodes,
            "Imbalance scored"
        );
    }

    pub fn log_move_proposed(&self, planned: &PlannedMove) {
        info!(
            event = "move_proposed",
            cluster = %self.cluster,
            workload_id = %planned.workload.id,
            kind = %planned.workload.kind,
            source = %planned.source,
            destination = %planned.destination,
            reason = %planned.reason,
            score_delta = planned.delta(),
            "Move proposed"
        );
    }

    pub fn log_move_approved(&self, planned: &PlannedMove) {
        info!(
            event = "move_approved",
            cluster = %self.cluster,
            workload_id = %planned.workload.id,
            source = %planned.source,
            destination = %planned.destination,
            "Move approved"
        );
    }

    pub fn log_move_rejected(&self, planned: &PlannedMove, reason: &RejectReason) {
        warn!(
            event = "move_rejected",
            cluster = %self.cluster,
            workload_id = %planned.workload.id,
            source = %planned.source,
            destination = %planned.destination,
            reason = %reason,
            "Move rejected by safety gate"
        );
    }

    pub fn log_move_executed(&self, planned: &PlannedMove, outcome: &MoveOutcome) {
        match outcome {
            MoveOutcome::Succeeded { attempts } => info!(
                event = "move_executed",
                cluster = %self.cluster,
                workload_id = %planned.workload.id,
                source = %planned.source,
                destination = %planned.destination,
                outcome = outcome.label(),
                attempts = attempts,
                "Migration succeeded"
            ),
            MoveOutcome::TransientExhausted { attempts, error }
            | MoveOutcome::PermanentFailure { attempts, error } => warn!(
                event = "move_executed",
                cluster = %self.cluster,
                workload_id = %planned.workload.id,
                source = %planned.source,
                destination = %planned.destination,
                outcome = outcome.label(),
                attempts = attempts,
                error = %error,
                "Migration failed"
            ),
            MoveOutcome::Skipped => info!(
                event = "move_executed",
                cluster = %self.cluster,
                workload_id = %planned.workload.id,
                outcome = outcome.label(),
                "Migration skipped, shutdown requested"
            ),
            MoveOutcome::DryRun => info!(
                event = "move_executed",
                cluster = %self.cluster,
                workload_id = %planned.workload.id,
                source = %planned.source,
                destination = %planned.destination,
                outcome = outcome.label(),
                "Dry run, would migrate"
            ),
        }
    }

    pub fn log_move_retry(&self, planned: &PlannedMove, attempt: u32, delay: Duration, error: &str) {
        warn!(
            event = "move_retry",
            cluster = %self.cluster,
            workload_id = %planned.workload.id,
            destination = %planned.destination,
            attempt = attempt,
            retry_in_ms = delay.as_millis() as u64,
            error = %error,
            "Transient migration failure, retrying"
        );
    }

    pub fn log_startup(&self, version: &str, dry_run: bool, interval: Duration) {
        info!(
            event = "daemon_started",
            cluster = %self.cluster,
            version = %version,
            dry_run = dry_run,
            interval_secs = interval.as_secs(),
            "ProxLB daemon started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "daemon_shutdown",
            cluster = %self.cluster,
            reason = %reason,
            "ProxLB daemon shutting down"
        );
    }
}
