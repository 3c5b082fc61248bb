//! Proxmox VE API client
//!
//! Talks to `/api2/json` with an API token. Node metrics come from
//! `nodes/{node}/status`, workloads from `cluster/resources`, and migrations
//! are started on the source node and then followed through the task API
//! until the task stops.

use super::{async_trait, NodeListing, NodeMetrics, PlatformClient, WorkloadReading};
use crate::error::PlatformError;
use crate::models::{Resources, Workload, WorkloadKind};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Connection settings for a Proxmox VE cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxmoxConfig {
    /// Base URL of any cluster member, e.g. `https://pve1.example.com:8006`
    pub host: String,

    #[serde(default = "default_user")]
    pub user: String,

    /// API token id (the part after `!`)
    pub token_id: String,

    pub token_secret: String,

    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,

    /// Timeout for a single HTTP request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Delay between task status polls while a migration runs
    #[serde(default = "default_task_poll_interval_ms")]
    pub task_poll_interval_ms: u64,

    /// Workloads carrying this tag are never migrated
    #[serde(default = "default_pin_tag")]
    pub pin_tag: Option<String>,

    /// Allow migrating VMs with local disks
    #[serde(default)]
    pub with_local_disks: bool,
}

fn default_user() -> String {
    "root@pam".to_string()
}

fn default_verify_ssl() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_task_poll_interval_ms() -> u64 {
    2_000
}

fn default_pin_tag() -> Option<String> {
    Some("proxlb-pin".to_string())
}

impl ProxmoxConfig {
    pub fn new(host: impl Into<String>, token_id: impl Into<String>, token_secret: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: default_user(),
            token_id: token_id.into(),
            token_secret: token_secret.into(),
            verify_ssl: default_verify_ssl(),
            request_timeout_secs: default_request_timeout_secs(),
            task_poll_interval_ms: default_task_poll_interval_ms(),
            pin_tag: default_pin_tag(),
            with_local_disks: false,
        }
    }

    /// Value of the `Authorization` header
    fn authorization(&self) -> String {
        format!(
            "PVEAPIToken={}!{}={}",
            self.user, self.token_id, self.token_secret
        )
    }
}

/// Every Proxmox response wraps its payload in `data`
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct NodeEntry {
    node: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NodeStatusData {
    #[serde(default)]
    cpu: f64,
    cpuinfo: CpuInfo,
    memory: UsageInfo,
    #[serde(default)]
    rootfs: Option<UsageInfo>,
}

#[derive(Debug, Deserialize)]
struct CpuInfo {
    cpus: u32,
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    total: u64,
    used: u64,
}

#[derive(Debug, Deserialize)]
struct ResourceEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    vmid: Option<u64>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    node: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    cpu: f64,
    #[serde(default)]
    maxcpu: f64,
    #[serde(default)]
    mem: u64,
    #[serde(default)]
    disk: u64,
    #[serde(default)]
    template: u8,
    #[serde(default)]
    tags: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

/// [`PlatformClient`] backed by the Proxmox VE REST API
pub struct ProxmoxClient {
    client: Client,
    base_url: Url,
    config: ProxmoxConfig,
}

impl ProxmoxClient {
    /// Create a new client; no request is made until the first call
    pub fn new(config: ProxmoxConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()
            .context("Failed to create HTTP client")?;

        let mut base = config.host.trim_end_matches('/').to_string();
        base.push_str("/api2/json/");
        let base_url = Url::parse(&base).context("Invalid Proxmox host URL")?;

        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    fn url(&self, path: &str) -> Result<Url, PlatformError> {
        self.base_url
            .join(path)
            .map_err(|e| PlatformError::InvalidResponse(format!("invalid path {path}: {e}")))
    }

    /// Send a request and unwrap the `data` payload
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, PlatformError> {
        let response = request
            .header("Authorization", self.config.authorization())
            .send()
            .await
            .map_err(|e| self.classify_transport(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        response
            .json::<ApiResponse<T>>()
            .await
            .map(|r| r.data)
            .map_err(|e| PlatformError::InvalidResponse(e.to_string()))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, PlatformError> {
        let url = self.url(path)?;
        self.send(self.client.get(url)).await
    }

    fn classify_transport(&self, err: reqwest::Error) -> PlatformError {
        if err.is_timeout() {
            PlatformError::Timeout(Duration::from_secs(self.config.request_timeout_secs))
        } else if err.is_connect() || err.is_request() {
            PlatformError::Unavailable(err.to_string())
        } else {
            PlatformError::InvalidResponse(err.to_string())
        }
    }

    /// Follow a task until it stops
    async fn wait_for_task(&self, node: &str, upid: &str) -> Result<(), PlatformError> {
        let path = format!("nodes/{node}/tasks/{upid}/status");
        let poll_interval = Duration::from_millis(self.config.task_poll_interval_ms);

        loop {
            let task: TaskStatus = self.get(&path).await?;
            if let Some(result) = task_outcome(&task) {
                return result;
            }
            debug!(node = %node, upid = %upid, "Migration task still running");
            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[async_trait]
impl PlatformClient for ProxmoxClient {
    async fn list_nodes(&self) -> Result<Vec<NodeListing>, PlatformError> {
        let entries: Vec<NodeEntry> = self.get("nodes").await?;
        Ok(entries
            .into_iter()
            .map(|entry| NodeListing {
                online: entry.status.as_deref() == Some("online"),
                id: entry.node,
            })
            .collect())
    }

    async fn node_metrics(&self, node: &str) -> Result<NodeMetrics, PlatformError> {
        let status: NodeStatusData = self.get(&format!("nodes/{node}/status")).await?;
        Ok(node_metrics_from_status(&status))
    }

    async fn list_workloads(&self) -> Result<Vec<WorkloadReading>, PlatformError> {
        let entries: Vec<ResourceEntry> = self.get("cluster/resources?type=vm").await?;
        Ok(workloads_from_resources(entries, self.config.pin_tag.as_deref()))
    }

    async fn migrate(&self, workload: &Workload, destination: &str) -> Result<(), PlatformError> {
        let (endpoint, mut params) = match workload.kind {
            WorkloadKind::Vm => ("qemu", vec![("target", destination), ("online", "1")]),
            WorkloadKind::Container => ("lxc", vec![("target", destination), ("restart", "1")]),
        };
        if workload.kind == WorkloadKind::Vm && self.config.with_local_disks {
            params.push(("with-local-disks", "1"));
        }

        let path = format!("nodes/{}/{}/{}/migrate", workload.host, endpoint, workload.id);
        let url = self.url(&path)?;

        let upid: String = match self.send(self.client.post(url).form(&params)).await {
            Err(PlatformError::Rejected(msg)) if msg.starts_with("404") => {
                return Err(PlatformError::WorkloadNotFound(workload.id.clone()));
            }
            other => other?,
        };

        debug!(
            workload_id = %workload.id,
            source = %workload.host,
            destination = %destination,
            upid = %upid,
            "Migration task started"
        );

        self.wait_for_task(&workload.host, &upid).await
    }
}

/// Convert a node status payload into capacity/usage readings
fn node_metrics_from_status(status: &NodeStatusData) -> NodeMetrics {
    let cores = f64::from(status.cpuinfo.cpus);
    let (storage_total, storage_used) = status
        .rootfs
        .as_ref()
        .map(|fs| (fs.total, fs.used))
        .unwrap_or((0, 0));

    NodeMetrics {
        total: Resources::new(cores, status.memory.total, storage_total),
        consumed: Resources::new(status.cpu * cores, status.memory.used, storage_used),
    }
}

/// Keep running, non-template VMs and containers
fn workloads_from_resources(entries: Vec<ResourceEntry>, pin_tag: Option<&str>) -> Vec<WorkloadReading> {
    entries
        .into_iter()
        .filter_map(|entry| {
            let kind = match entry.kind.as_str() {
                "qemu" => WorkloadKind::Vm,
                "lxc" => WorkloadKind::Container,
                _ => return None,
            };
            if entry.template == 1 || entry.status.as_deref() != Some("running") {
                return None;
            }
            let (Some(vmid), Some(host)) = (entry.vmid, entry.node) else {
                warn!(kind = %entry.kind, "Skipping workload without vmid or node");
                return None;
            };

            let pinned = match (pin_tag, entry.tags.as_deref()) {
                (Some(tag), Some(tags)) => tags
                    .split([';', ',', ' '])
                    .any(|t| t.trim() == tag),
                _ => false,
            };

            Some(WorkloadReading {
                id: vmid.to_string(),
                name: entry.name,
                kind,
                host,
                footprint: Resources::new(entry.cpu * entry.maxcpu, entry.mem, entry.disk),
                pinned,
            })
        })
        .collect()
}

/// Classify a non-success HTTP status
fn classify_status(status: StatusCode, body: &str) -> PlatformError {
    let message = format!("{} {}", status.as_u16(), body.trim());
    let lowered = body.to_ascii_lowercase();

    if lowered.contains("locked") || lowered.contains("busy") {
        PlatformError::Busy(message)
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        PlatformError::Unavailable(message)
    } else {
        PlatformError::Rejected(message)
    }
}

/// `None` while the task runs, the classified result once it stopped
fn task_outcome(task: &TaskStatus) -> Option<Result<(), PlatformError>> {
    if task.status != "stopped" {
        return None;
    }
    let exit = task.exitstatus.as_deref().unwrap_or("unknown");
    if exit == "OK" {
        return Some(Ok(()));
    }
    let lowered = exit.to_ascii_lowercase();
    if lowered.contains("lock") || lowered.contains("busy") || lowered.contains("timeout") {
        Some(Err(PlatformError::Busy(exit.to_string())))
    } else {
        Some(Err(PlatformError::Rejected(exit.to_string())))
    }
}
