//! Bootstrap configuration
//!
//! The configuration file mirrors the `managementCluster:` document operators
//! already keep next to their infrastructure:
//!
//! ```yaml
//! managementCluster:
//!   name: mgmt
//!   provider: proxmox
//!   nodes:
//!     - role: control-plane
//!       count: 1
//!       cpu: 4
//!       ram: 8GB
//!       disk: 50GB
//!       isoUUID: local:iso/talos-amd64.iso
//!   talos:
//!     version: v1.9.5
//!     controlPlaneEndpoint: mgmt.example.internal
//!     controlPlaneVIP: 10.0.0.100
//!   flux:
//!     gitOwner: platform
//!     gitRepository: fleet
//!     gitPath: clusters/mgmt
//! ```

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("managementCluster.{0} is required")]
    MissingField(&'static str),

    #[error("at least one node group is required")]
    NoNodeGroups,

    #[error("at least one control-plane node is required")]
    NoControlPlane,

    #[error("node group {index} ({role}) must have a count of at least 1")]
    EmptyNodeGroup { index: usize, role: NodeRole },

    #[error("invalid size {value:?}: expected a number followed by MB, GB or TB")]
    InvalidSize { value: String },

    #[error("unsupported provider {0:?}")]
    UnsupportedProvider(String),

    #[error("invalid provider settings: {0}")]
    InvalidProvider(String),
}

/// Root of the configuration document
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapConfig {
    pub management_cluster: ClusterSpec,
}

/// The cluster to build. Immutable once a run starts.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Cluster name, also the prefix of every VM name
    #[serde(default)]
    pub name: String,

    /// Infrastructure provider identifier (e.g. "proxmox")
    #[serde(default)]
    pub provider: String,

    /// Proxmox VE connection and placement settings
    #[serde(default)]
    pub proxmox: ProxmoxConfig,

    /// Ordered node groups
    #[serde(default)]
    pub nodes: Vec<NodeGroup>,

    /// Node operating system settings
    #[serde(default)]
    pub talos: OsSettings,

    /// GitOps hand-off settings
    #[serde(default)]
    pub flux: GitOpsSettings,

    /// Poll intervals, timeouts and retry budgets
    #[serde(default)]
    pub timings: Timings,

    /// Directory holding generated OS configs, kubeconfig and manifests
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("talosconfig")
}

/// Node role within the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    ControlPlane,
    Worker,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::ControlPlane => "control-plane",
            NodeRole::Worker => "worker",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of identically sized VMs sharing a role
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroup {
    pub role: NodeRole,

    #[serde(default = "default_count")]
    pub count: u32,

    /// Virtual CPU cores per VM
    #[serde(default = "default_cpu")]
    pub cpu: u32,

    /// Memory per VM, e.g. "8GB"
    #[serde(default = "default_ram")]
    pub ram: String,

    /// Boot disk size per VM, e.g. "50GB"
    #[serde(default = "default_disk")]
    pub disk: String,

    /// Boot image reference understood by the provider
    #[serde(rename = "isoUUID", default)]
    pub iso_uuid: String,

    /// Additional data disks, e.g. ["100GB"]
    #[serde(default)]
    pub extra_disks: Vec<String>,
}

fn default_count() -> u32 {
    1
}

fn default_cpu() -> u32 {
    2
}

fn default_ram() -> String {
    "4GB".to_string()
}

fn default_disk() -> String {
    "50GB".to_string()
}

/// Node operating system settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OsSettings {
    /// OS release used for generated configs
    #[serde(default)]
    pub version: String,

    /// DNS-style Kubernetes API endpoint baked into node configs
    #[serde(default)]
    pub control_plane_endpoint: String,

    /// Floating IP served by the VIP daemon
    #[serde(rename = "controlPlaneVIP", default)]
    pub control_plane_vip: String,

    /// Host interface the VIP daemon announces on
    #[serde(default = "default_network_interface")]
    pub network_interface: String,

    /// Image tag of the VIP daemon
    #[serde(default = "default_kube_vip_version")]
    pub kube_vip_version: String,
}

fn default_network_interface() -> String {
    "ens3".to_string()
}

fn default_kube_vip_version() -> String {
    "v0.8.9".to_string()
}

/// GitOps controller bootstrap settings
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitOpsSettings {
    #[serde(default)]
    pub git_owner: String,

    #[serde(default)]
    pub git_repository: String,

    #[serde(default = "default_git_branch")]
    pub git_branch: String,

    #[serde(default)]
    pub git_path: String,

    #[serde(default = "default_git_hostname")]
    pub git_hostname: String,

    /// Repository access token. Prefer the GITLAB_TOKEN environment variable.
    #[serde(rename = "gitPAT", default, skip_serializing)]
    pub git_pat: Option<String>,
}

impl Default for GitOpsSettings {
    fn default() -> Self {
        Self {
            git_owner: String::new(),
            git_repository: String::new(),
            git_branch: default_git_branch(),
            git_path: String::new(),
            git_hostname: default_git_hostname(),
            git_pat: None,
        }
    }
}

fn default_git_branch() -> String {
    "main".to_string()
}

fn default_git_hostname() -> String {
    "gitlab.com".to_string()
}

/// Proxmox VE settings
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxConfig {
    /// API base URL, e.g. "https://pve.example.internal:8006"
    #[serde(default)]
    pub endpoint: String,

    /// User with realm, e.g. "root@pam"
    #[serde(default)]
    pub username: String,

    #[serde(default, skip_serializing)]
    pub password: String,

    /// Storage backing the boot disks, e.g. "local-lvm"
    #[serde(default)]
    pub storage_location: String,

    #[serde(rename = "availableVMIdStart", default = "default_vm_id_start")]
    pub available_vm_id_start: u32,

    #[serde(rename = "availableVMIdEnd", default = "default_vm_id_end")]
    pub available_vm_id_end: u32,

    /// Hypervisor nodes VMs may be placed on
    #[serde(default)]
    pub nodes: Vec<String>,

    #[serde(default = "default_bridge")]
    pub bridge: String,

    /// Accept self-signed API certificates
    #[serde(default)]
    pub insecure_tls: bool,
}

impl Default for ProxmoxConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            username: String::new(),
            password: String::new(),
            storage_location: String::new(),
            available_vm_id_start: default_vm_id_start(),
            available_vm_id_end: default_vm_id_end(),
            nodes: Vec::new(),
            bridge: default_bridge(),
            insecure_tls: false,
        }
    }
}

fn default_vm_id_start() -> u32 {
    100
}

fn default_vm_id_end() -> u32 {
    999
}

fn default_bridge() -> String {
    "vmbr0".to_string()
}

/// Poll intervals, timeouts and retry budgets, in seconds
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct Timings {
    pub vm_poll_interval_secs: u64,
    pub vm_ready_timeout_secs: u64,
    /// Maximum VMs polled at once
    pub vm_poll_concurrency: usize,
    pub os_registration_timeout_secs: u64,
    pub os_registration_poll_secs: u64,
    pub api_warmup_secs: u64,
    pub api_poll_interval_secs: u64,
    pub api_timeout_secs: u64,
    pub vip_api_timeout_secs: u64,
    /// How close to the API deadline the kubeconfig context gets refreshed
    pub context_refresh_window_secs: u64,
    pub node_wait_timeout_secs: u64,
    pub node_poll_interval_secs: u64,
    pub gitops_max_attempts: u32,
    pub gitops_backoff_step_secs: u64,
    /// Per-invocation limit for external tools
    pub tool_timeout_secs: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            vm_poll_interval_secs: 10,
            vm_ready_timeout_secs: 600,
            vm_poll_concurrency: 8,
            os_registration_timeout_secs: 180,
            os_registration_poll_secs: 10,
            api_warmup_secs: 60,
            api_poll_interval_secs: 10,
            api_timeout_secs: 300,
            vip_api_timeout_secs: 120,
            context_refresh_window_secs: 30,
            node_wait_timeout_secs: 120,
            node_poll_interval_secs: 5,
            gitops_max_attempts: 3,
            gitops_backoff_step_secs: 10,
            tool_timeout_secs: 300,
        }
    }
}

impl Timings {
    pub fn vm_poll_interval(&self) -> Duration {
        Duration::from_secs(self.vm_poll_interval_secs)
    }

    pub fn vm_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.vm_ready_timeout_secs)
    }

    pub fn os_registration_timeout(&self) -> Duration {
        Duration::from_secs(self.os_registration_timeout_secs)
    }

    pub fn os_registration_poll(&self) -> Duration {
        Duration::from_secs(self.os_registration_poll_secs)
    }

    pub fn api_warmup(&self) -> Duration {
        Duration::from_secs(self.api_warmup_secs)
    }

    pub fn api_poll_interval(&self) -> Duration {
        Duration::from_secs(self.api_poll_interval_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn vip_api_timeout(&self) -> Duration {
        Duration::from_secs(self.vip_api_timeout_secs)
    }

    pub fn context_refresh_window(&self) -> Duration {
        Duration::from_secs(self.context_refresh_window_secs)
    }

    pub fn node_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.node_wait_timeout_secs)
    }

    pub fn node_poll_interval(&self) -> Duration {
        Duration::from_secs(self.node_poll_interval_secs)
    }

    pub fn gitops_backoff_step(&self) -> Duration {
        Duration::from_secs(self.gitops_backoff_step_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

impl BootstrapConfig {
    /// Load, apply environment overrides and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::from_yaml(&raw)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.management_cluster.validate()?;
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Apply environment overrides
    ///
    /// Recognised variables:
    /// - `BUTLER_CLUSTER_NAME` overrides `managementCluster.name`
    /// - `BUTLER_PROVIDER` overrides `managementCluster.provider`
    /// - `BUTLER_WORK_DIR` overrides `managementCluster.workDir`
    /// - `PROXMOX_PASSWORD` overrides `managementCluster.proxmox.password`
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let cluster = &mut self.management_cluster;
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(name) = non_empty("BUTLER_CLUSTER_NAME") {
            cluster.name = name;
        }
        if let Some(provider) = non_empty("BUTLER_PROVIDER") {
            cluster.provider = provider;
        }
        if let Some(dir) = non_empty("BUTLER_WORK_DIR") {
            cluster.work_dir = PathBuf::from(dir);
        }
        if let Some(password) = non_empty("PROXMOX_PASSWORD") {
            cluster.proxmox.password = password;
        }
    }
}

impl ClusterSpec {
    /// Check required fields before any external call is made
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingField("name"));
        }
        if self.provider.trim().is_empty() {
            return Err(ConfigError::MissingField("provider"));
        }
        if self.nodes.is_empty() {
            return Err(ConfigError::NoNodeGroups);
        }

        for (index, group) in self.nodes.iter().enumerate() {
            if group.count == 0 {
                return Err(ConfigError::EmptyNodeGroup {
                    index,
                    role: group.role,
                });
            }
            parse_size_mib(&group.ram)?;
            parse_size_mib(&group.disk)?;
            for extra in &group.extra_disks {
                parse_size_mib(extra)?;
            }
        }

        if !self
            .nodes
            .iter()
            .any(|group| group.role == NodeRole::ControlPlane)
        {
            return Err(ConfigError::NoControlPlane);
        }

        if self.talos.control_plane_endpoint.trim().is_empty() {
            return Err(ConfigError::MissingField("talos.controlPlaneEndpoint"));
        }
        if self.talos.control_plane_vip.trim().is_empty() {
            return Err(ConfigError::MissingField("talos.controlPlaneVIP"));
        }

        Ok(())
    }
}

/// Parse a human size string into mebibytes
///
/// "8GB" and "8G" become 8192, "512MB" stays 512, "1TB" becomes 1048576.
/// A bare number is read as gigabytes, the unit every config in the wild uses.
pub fn parse_size_mib(value: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::InvalidSize {
        value: value.to_string(),
    };

    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    let amount: u64 = digits.parse().map_err(|_| invalid())?;

    let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "G" | "GB" | "GI" | "GIB" => 1024,
        "M" | "MB" | "MI" | "MIB" => 1,
        "T" | "TB" | "TI" | "TIB" => 1024 * 1024,
        _ => return Err(invalid()),
    };

    if amount == 0 {
        return Err(invalid());
    }

    amount.checked_mul(multiplier).ok_or_else(invalid)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
