//! Daemon configuration
//!
//! Layered with the `config` crate: an optional YAML/TOML file first, then
//! environment variables prefixed with `PROXLB_`, using `__` between nested
//! keys (`PROXLB_BALANCER__DRY_RUN=true`, `PROXLB_PROXMOX__HOST=...`).

use anyhow::{Context, Result};
use balancer_lib::{platform::ProxmoxConfig, BalancerConfig};
use serde::Deserialize;
use std::path::Path;

/// Config file read when `--config` is not given; missing is fine
pub const DEFAULT_CONFIG_FILE: &str = "proxlb.yaml";

/// Keys whose environment values are comma-separated lists
const LIST_KEYS: [&str; 3] = [
    "balancer.pinned_workloads",
    "balancer.maintenance_nodes",
    "balancer.nodes",
];

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Fallback log filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Port for health, metrics and status endpoints
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Name attached to every structured log event
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    pub proxmox: ProxmoxConfig,

    #[serde(default)]
    pub balancer: BalancerConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_cluster_name() -> String {
    "proxmox".to_string()
}

impl DaemonConfig {
    /// Load from `path` (or the default file) and the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, Self::environment())
    }

    /// Load from `path` and an explicit environment source, then validate
    pub fn load_with(path: Option<&Path>, environment: config::Environment) -> Result<Self> {
        let (file, required) = match path {
            Some(path) => (path, true),
            None => (Path::new(DEFAULT_CONFIG_FILE), false),
        };

        let settings = config::Config::builder()
            .add_source(config::File::from(file).required(required))
            .add_source(environment)
            .build()
            .with_context(|| format!("failed to read configuration from {}", file.display()))?;

        let daemon: DaemonConfig = settings
            .try_deserialize()
            .context("invalid configuration")?;
        daemon.balancer.validate()?;
        Ok(daemon)
    }

    /// Environment source for `PROXLB_*` variables
    pub fn environment() -> config::Environment {
        let mut environment = config::Environment::with_prefix("PROXLB")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .list_separator(",");
        for key in LIST_KEYS {
            environment = environment.with_list_parse_key(key);
        }
        environment
    }
}
