//! Executor tests against a scripted platform

use super::*;
use crate::models::{Movability, Resources, Workload, WorkloadKind};
use crate::planner::MoveReason;
use crate::platform::{async_trait, NodeListing, NodeMetrics, WorkloadReading};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex as StdMutex;

/// Platform whose migrate results are scripted per workload
#[derive(Default)]
struct ScriptedPlatform {
    script: StdMutex<HashMap<String, VecDeque<Result<(), PlatformError>>>>,
    /// Result once a workload's script is used up
    fallback: StdMutex<HashMap<String, PlatformError>>,
    calls: StdMutex<Vec<String>>,
    delay: Duration,
    in_flight: StdMutex<HashMap<String, usize>>,
    max_per_node: StdMutex<usize>,
    total_in_flight: StdMutex<(usize, usize)>,
    /// Flipped to `true` during the first migration call
    shutdown_on_first_call: Option<watch::Sender<bool>>,
}

impl ScriptedPlatform {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn script(&self, workload: &str, results: Vec<Result<(), PlatformError>>) {
        self.script
            .lock()
            .unwrap()
            .insert(workload.to_string(), results.into());
    }

    fn always_fail(&self, workload: &str, error: PlatformError) {
        self.fallback
            .lock()
            .unwrap()
            .insert(workload.to_string(), error);
    }

    fn calls_for(&self, workload: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == workload)
            .count()
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn enter(&self, nodes: [&str; 2]) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let mut max = self.max_per_node.lock().unwrap();
        for node in nodes {
            let count = in_flight.entry(node.to_string()).or_insert(0);
            *count += 1;
            *max = (*max).max(*count);
        }
        let mut total = self.total_in_flight.lock().unwrap();
        total.0 += 1;
        total.1 = total.1.max(total.0);
    }

    fn leave(&self, nodes: [&str; 2]) {
        let mut in_flight = self.in_flight.lock().unwrap();
        for node in nodes {
            if let Some(count) = in_flight.get_mut(node) {
                *count -= 1;
            }
        }
        self.total_in_flight.lock().unwrap().0 -= 1;
    }
}

#[async_trait]
impl PlatformClient for ScriptedPlatform {
    async fn list_nodes(&self) -> Result<Vec<NodeListing>, PlatformError> {
        Ok(Vec::new())
    }

    async fn node_metrics(&self, node: &str) -> Result<NodeMetrics, PlatformError> {
        Err(PlatformError::NodeNotFound(node.to_string()))
    }

    async fn list_workloads(&self) -> Result<Vec<WorkloadReading>, PlatformError> {
        Ok(Vec::new())
    }

    async fn migrate(&self, workload: &Workload, destination: &str) -> Result<(), PlatformError> {
        let first = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(workload.id.clone());
            calls.len() == 1
        };
        if first {
            if let Some(tx) = &self.shutdown_on_first_call {
                let _ = tx.send(true);
            }
        }

        let nodes = [workload.host.as_str(), destination];
        self.enter(nodes);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.leave(nodes);

        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(&workload.id)
            .and_then(|queue| queue.pop_front());
        match scripted {
            Some(result) => result,
            None => match self.fallback.lock().unwrap().get(&workload.id) {
                Some(error) => Err(error.clone()),
                None => Ok(()),
            },
        }
    }
}

fn planned(workload: &str, source: &str, destination: &str) -> PlannedMove {
    PlannedMove {
        workload: Workload {
            id: workload.to_string(),
            name: None,
            kind: WorkloadKind::Vm,
            footprint: Resources::new(1.0, 1024, 0),
            host: source.to_string(),
            movability: Movability::Movable,
        },
        source: source.to_string(),
        destination: destination.to_string(),
        score_before: 100.0,
        score_after: 50.0,
        reason: MoveReason::Rebalance,
    }
}

fn test_config() -> BalancerConfig {
    BalancerConfig {
        cooldown_secs: 1800,
        failure_cooldown_secs: 300,
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2.0,
        },
        ..Default::default()
    }
}

fn executor(platform: Arc<ScriptedPlatform>, config: &BalancerConfig) -> Executor {
    Executor::new(platform, config, StructuredLogger::new("test"))
}

fn no_shutdown() -> watch::Receiver<bool> {
    // The last value stays readable after the sender is gone
    watch::channel(false).1
}

fn cooldown_secs(table: &CooldownTable, result: &MoveResult) -> i64 {
    let until = table.eligible_at(&result.planned.workload.id).unwrap();
    (until - result.finished_at).num_seconds()
}

#[tokio::test]
async fn test_success_sets_full_cooldown() {
    let platform = Arc::new(ScriptedPlatform::default());
    let config = test_config();
    let mut cooldowns = CooldownTable::new();

    let report = executor(platform.clone(), &config)
        .execute(
            vec![planned("100", "pve1", "pve2")],
            &mut cooldowns,
            &NodeLocks::new(),
            &no_shutdown(),
        )
        .await;

    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.results[0].outcome, MoveOutcome::Succeeded { attempts: 1 });
    assert_eq!(cooldown_secs(&cooldowns, &report.results[0]), 1800);
    assert_eq!(report.relocations().collect::<Vec<_>>(), vec![("100", "pve2")]);
}

#[tokio::test]
async fn test_always_transient_retries_max_attempts_then_short_cooldown() {
    let platform = Arc::new(ScriptedPlatform::default());
    platform.always_fail("100", PlatformError::Busy("VM is locked (migrate)".into()));
    let config = test_config();
    let mut cooldowns = CooldownTable::new();

    let report = executor(platform.clone(), &config)
        .execute(
            vec![planned("100", "pve1", "pve2")],
            &mut cooldowns,
            &NodeLocks::new(),
            &no_shutdown(),
        )
        .await;

    assert_eq!(platform.calls_for("100"), 3);
    let result = &report.results[0];
    assert!(matches!(
        result.outcome,
        MoveOutcome::TransientExhausted { attempts: 3, .. }
    ));
    assert_eq!(report.relocations().count(), 0);

    let failure_cooldown = cooldown_secs(&cooldowns, result);
    assert_eq!(failure_cooldown, 300);
    assert!(failure_cooldown < config.cooldown_secs as i64);
}

#[tokio::test]
async fn test_transient_then_success() {
    let platform = Arc::new(ScriptedPlatform::default());
    platform.script(
        "100",
        vec![Err(PlatformError::Unavailable("HTTP 503".into())), Ok(())],
    );
    let config = test_config();
    let mut cooldowns = CooldownTable::new();

    let report = executor(platform.clone(), &config)
        .execute(
            vec![planned("100", "pve1", "pve2")],
            &mut cooldowns,
            &NodeLocks::new(),
            &no_shutdown(),
        )
        .await;

    assert_eq!(platform.calls_for("100"), 2);
    assert_eq!(report.results[0].outcome, MoveOutcome::Succeeded { attempts: 2 });
}

#[tokio::test]
async fn test_permanent_failure_abandons_and_continues() {
    let platform = Arc::new(ScriptedPlatform::default());
    platform.always_fail("100", PlatformError::WorkloadNotFound("100".into()));
    let config = test_config();
    let mut cooldowns = CooldownTable::new();

    let report = executor(platform.clone(), &config)
        .execute(
            vec![planned("100", "pve1", "pve2"), planned("101", "pve1", "pve3")],
            &mut cooldowns,
            &NodeLocks::new(),
            &no_shutdown(),
        )
        .await;

    assert_eq!(platform.calls_for("100"), 1);
    assert!(matches!(
        report.results[0].outcome,
        MoveOutcome::PermanentFailure { attempts: 1, .. }
    ));
    assert_eq!(cooldown_secs(&cooldowns, &report.results[0]), 1800);
    assert!(report.results[1].outcome.is_success());
    assert_eq!(report.failed(), 1);
    assert_eq!(report.succeeded(), 1);
}

#[tokio::test]
async fn test_call_timeout_is_transient() {
    let platform = Arc::new(ScriptedPlatform::with_delay(Duration::from_millis(200)));
    let mut config = test_config();
    config.retry.max_attempts = 2;
    let mut cooldowns = CooldownTable::new();

    let report = executor(platform.clone(), &config)
        .with_migration_timeout(Duration::from_millis(20))
        .execute(
            vec![planned("100", "pve1", "pve2")],
            &mut cooldowns,
            &NodeLocks::new(),
            &no_shutdown(),
        )
        .await;

    assert_eq!(platform.calls_for("100"), 2);
    match &report.results[0].outcome {
        MoveOutcome::TransientExhausted { attempts, error } => {
            assert_eq!(*attempts, 2);
            assert!(error.contains("timed out"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn test_dry_run_issues_no_calls_and_no_cooldowns() {
    let platform = Arc::new(ScriptedPlatform::default());
    let config = BalancerConfig {
        dry_run: true,
        ..test_config()
    };
    let mut cooldowns = CooldownTable::new();

    let report = executor(platform.clone(), &config)
        .execute(
            vec![planned("100", "pve1", "pve2"), planned("101", "pve3", "pve2")],
            &mut cooldowns,
            &NodeLocks::new(),
            &no_shutdown(),
        )
        .await;

    assert_eq!(platform.total_calls(), 0);
    assert!(cooldowns.is_empty());
    assert!(report.results.iter().all(|r| r.outcome == MoveOutcome::DryRun));
    assert_eq!(report.relocations().count(), 0);
}

#[tokio::test]
async fn test_shutdown_before_start_skips_everything() {
    let platform = Arc::new(ScriptedPlatform::default());
    let (tx, rx) = watch::channel(true);
    let mut cooldowns = CooldownTable::new();

    let report = executor(platform.clone(), &test_config())
        .execute(
            vec![planned("100", "pve1", "pve2"), planned("101", "pve3", "pve4")],
            &mut cooldowns,
            &NodeLocks::new(),
            &rx,
        )
        .await;
    drop(tx);

    assert_eq!(platform.total_calls(), 0);
    assert_eq!(report.skipped(), 2);
    assert!(cooldowns.is_empty());
}

#[tokio::test]
async fn test_shutdown_lets_in_flight_move_finish() {
    let (tx, rx) = watch::channel(false);
    let platform = Arc::new(ScriptedPlatform {
        delay: Duration::from_millis(20),
        shutdown_on_first_call: Some(tx),
        ..Default::default()
    });
    let mut cooldowns = CooldownTable::new();

    let report = executor(platform.clone(), &test_config())
        .execute(
            vec![
                planned("100", "pve1", "pve2"),
                planned("101", "pve1", "pve3"),
                planned("102", "pve1", "pve4"),
            ],
            &mut cooldowns,
            &NodeLocks::new(),
            &rx,
        )
        .await;

    assert_eq!(platform.total_calls(), 1);
    assert!(report.results[0].outcome.is_success());
    assert_eq!(report.results[1].outcome, MoveOutcome::Skipped);
    assert_eq!(report.results[2].outcome, MoveOutcome::Skipped);
    assert_eq!(cooldowns.len(), 1);
}

#[tokio::test]
async fn test_moves_sharing_a_node_never_overlap() {
    let platform = Arc::new(ScriptedPlatform::with_delay(Duration::from_millis(30)));
    let config = BalancerConfig {
        concurrency: 4,
        ..test_config()
    };
    let mut cooldowns = CooldownTable::new();

    let report = executor(platform.clone(), &config)
        .execute(
            vec![
                planned("100", "pve1", "pve2"),
                planned("101", "pve3", "pve4"),
                planned("102", "pve2", "pve5"),
                planned("103", "pve6", "pve1"),
            ],
            &mut cooldowns,
            &NodeLocks::new(),
            &no_shutdown(),
        )
        .await;

    assert_eq!(report.succeeded(), 4);
    assert_eq!(*platform.max_per_node.lock().unwrap(), 1);
    // 100 and 101 are disjoint and run side by side
    assert!(platform.total_in_flight.lock().unwrap().1 >= 2);
    // Report stays in plan order
    let ids: Vec<_> = report
        .results
        .iter()
        .map(|r| r.planned.workload.id.as_str())
        .collect();
    assert_eq!(ids, vec!["100", "101", "102", "103"]);
}

#[tokio::test]
async fn test_concurrency_one_is_sequential() {
    let platform = Arc::new(ScriptedPlatform::with_delay(Duration::from_millis(5)));
    let mut cooldowns = CooldownTable::new();

    executor(platform.clone(), &test_config())
        .execute(
            vec![planned("100", "pve1", "pve2"), planned("101", "pve3", "pve4")],
            &mut cooldowns,
            &NodeLocks::new(),
            &no_shutdown(),
        )
        .await;

    assert_eq!(platform.total_in_flight.lock().unwrap().1, 1);
}

#[tokio::test]
async fn test_moves_start_in_plan_order_behind_busy_node() {
    let platform = Arc::new(ScriptedPlatform::with_delay(Duration::from_millis(20)));
    let config = BalancerConfig {
        concurrency: 2,
        ..test_config()
    };
    let locks = NodeLocks::new();
    let mut cooldowns = CooldownTable::new();

    // 101 waits on pve2; 102 shares no node with either but still starts last
    let report = executor(platform.clone(), &config)
        .execute(
            vec![
                planned("100", "pve1", "pve2"),
                planned("101", "pve2", "pve3"),
                planned("102", "pve4", "pve5"),
            ],
            &mut cooldowns,
            &locks,
            &no_shutdown(),
        )
        .await;

    assert_eq!(report.succeeded(), 3);
    assert_eq!(
        platform.calls.lock().unwrap().clone(),
        vec!["100".to_string(), "101".to_string(), "102".to_string()]
    );
    assert_eq!(*platform.max_per_node.lock().unwrap(), 1);
    assert!(!locks.is_locked("pve2"));
}
