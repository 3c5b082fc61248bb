//! Decision engine and migration orchestrator for the ProxLB daemon
//!
//! This crate provides:
//! - Immutable cluster snapshots and their collection from the platform
//! - Imbalance scoring and greedy migration planning
//! - A safety gate with per-workload cooldowns
//! - A bounded-concurrency migration executor with retries and node locks
//! - The control loop tying the stages together
//! - A Proxmox VE platform client, health checks and observability

pub mod config;
pub mod control;
pub mod cooldown;
pub mod error;
pub mod executor;
pub mod gate;
pub mod health;
pub mod models;
pub mod observability;
pub mod planner;
pub mod platform;
pub mod scorer;
pub mod snapshot;

pub use config::{BalancerConfig, RetryConfig, ScoringWeights};
pub use control::{ControlLoop, ControlLoopBuilder, CycleReport, CycleState, LoopStatus, StatusHandle};
pub use cooldown::CooldownTable;
pub use error::{ConfigError, CycleError, PlatformError};
pub use executor::{ExecutionReport, Executor, MoveOutcome, NodeLocks};
pub use gate::{GateDecision, RejectReason, SafetyGate};
pub use health::{ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse};
pub use models::*;
pub use observability::{BalancerMetrics, StructuredLogger};
pub use planner::{MigrationPlan, MoveReason, PlannedMove, Planner};
pub use scorer::ImbalanceScorer;
pub use snapshot::{ClusterSnapshot, SnapshotCollector, SnapshotPolicy};
