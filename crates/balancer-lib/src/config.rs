//! Balancer configuration
//!
//! Read once at startup, validated, and then shared read-only with every
//! component. Durations are stored as integer seconds/milliseconds so the
//! struct deserializes cleanly from YAML files and environment variables.

use crate::error::ConfigError;
use crate::models::{Dimension, DIMENSIONS};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-dimension weights of the imbalance score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    #[serde(default = "default_cpu_weight")]
    pub cpu: f64,
    #[serde(default = "default_memory_weight")]
    pub memory: f64,
    #[serde(default)]
    pub storage: f64,
}

fn default_cpu_weight() -> f64 {
    1.0
}

fn default_memory_weight() -> f64 {
    1.0
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            cpu: default_cpu_weight(),
            memory: default_memory_weight(),
            storage: 0.0,
        }
    }
}

impl ScoringWeights {
    pub fn get(&self, dimension: Dimension) -> f64 {
        match dimension {
            Dimension::Cpu => self.cpu,
            Dimension::Memory => self.memory,
            Dimension::Storage => self.storage,
        }
    }

    pub fn as_array(&self) -> [f64; DIMENSIONS] {
        [self.cpu, self.memory, self.storage]
    }
}

/// Retry policy for transient migration failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total number of migration calls per move, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound for the delay between retries
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Growth factor applied to the delay after every retry
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    5_000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Delay to wait after the given (1-based) failed attempt
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay_ms = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        let capped = delay_ms.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Configuration consumed by the decision engine and the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalancerConfig {
    #[serde(default)]
    pub weights: ScoringWeights,

    /// Minimum score reduction a move must achieve to be planned
    #[serde(default = "default_min_improvement")]
    pub min_improvement: f64,

    #[serde(default = "default_max_moves_per_cycle")]
    pub max_moves_per_cycle: usize,

    /// Cooldown after a successful (or permanently failed) migration
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Cooldown after a migration whose transient retries were exhausted
    #[serde(default = "default_failure_cooldown_secs")]
    pub failure_cooldown_secs: u64,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Upper bound for a single migration call
    #[serde(default = "default_migration_timeout_secs")]
    pub migration_timeout_secs: u64,

    /// Number of migrations allowed in flight at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Time between the end of one cycle and the start of the next
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    #[serde(default)]
    pub dry_run: bool,

    /// Workloads that must never be migrated
    #[serde(default)]
    pub pinned_workloads: Vec<String>,

    /// Nodes treated as in maintenance regardless of their platform status
    #[serde(default)]
    pub maintenance_nodes: Vec<String>,

    /// Nodes to manage; empty means every node the platform reports
    #[serde(default)]
    pub nodes: Vec<String>,

    /// Move workloads off maintenance nodes before rebalancing
    #[serde(default = "default_evacuate_maintenance")]
    pub evacuate_maintenance: bool,
}

fn default_min_improvement() -> f64 {
    1.0
}

fn default_max_moves_per_cycle() -> usize {
    5
}

fn default_cooldown_secs() -> u64 {
    30 * 60
}

fn default_failure_cooldown_secs() -> u64 {
    5 * 60
}

fn default_migration_timeout_secs() -> u64 {
    10 * 60
}

fn default_concurrency() -> usize {
    1
}

fn default_interval_secs() -> u64 {
    300
}

fn default_evacuate_maintenance() -> bool {
    true
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            min_improvement: default_min_improvement(),
            max_moves_per_cycle: default_max_moves_per_cycle(),
            cooldown_secs: default_cooldown_secs(),
            failure_cooldown_secs: default_failure_cooldown_secs(),
            retry: RetryConfig::default(),
            migration_timeout_secs: default_migration_timeout_secs(),
            concurrency: default_concurrency(),
            interval_secs: default_interval_secs(),
            dry_run: false,
            pinned_workloads: Vec::new(),
            maintenance_nodes: Vec::new(),
            nodes: Vec::new(),
            evacuate_maintenance: default_evacuate_maintenance(),
        }
    }
}

impl BalancerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_secs(self.failure_cooldown_secs)
    }

    pub fn migration_timeout(&self) -> Duration {
        Duration::from_secs(self.migration_timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        for dimension in Dimension::ALL {
            let weight = self.weights.get(dimension);
            if !weight.is_finite() || weight < 0.0 {
                return Err(ConfigError::invalid(
                    "weights",
                    format!("{dimension} weight must be a finite non-negative number, got {weight}"),
                ));
            }
        }
        if self.weights.as_array().iter().all(|w| *w == 0.0) {
            return Err(ConfigError::invalid(
                "weights",
                "at least one dimension must have a positive weight",
            ));
        }
        if !self.min_improvement.is_finite() || self.min_improvement < 0.0 {
            return Err(ConfigError::invalid(
                "min_improvement",
                "must be a finite non-negative number",
            ));
        }
        if self.max_moves_per_cycle == 0 {
            return Err(ConfigError::invalid(
                "max_moves_per_cycle",
                "must be at least 1",
            ));
        }
        if self.failure_cooldown_secs >= self.cooldown_secs {
            return Err(ConfigError::invalid(
                "failure_cooldown_secs",
                format!(
                    "must be shorter than cooldown_secs ({} >= {})",
                    self.failure_cooldown_secs, self.cooldown_secs
                ),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::invalid("retry.multiplier", "must be at least 1.0"));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::invalid(
                "retry.initial_backoff_ms",
                "must not exceed retry.max_backoff_ms",
            ));
        }
        if self.migration_timeout_secs == 0 {
            return Err(ConfigError::invalid("migration_timeout_secs", "must be at least 1"));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::invalid("concurrency", "must be at least 1"));
        }
        if self.interval_secs == 0 {
            return Err(ConfigError::invalid("interval_secs", "must be at least 1"));
        }
        Ok(())
    }
}
