//! Infrastructure provider abstraction
//!
//! The pipeline only ever talks to a [`ProviderAdapter`]. Which backend sits
//! behind it is decided once, from the `provider` field of the cluster spec.

pub mod proxmox;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{ClusterSpec, ConfigError, NodeRole};

pub use proxmox::ProxmoxProvider;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("VM {0} not found")]
    NotFound(String),

    #[error("invalid VM id {0:?}")]
    InvalidId(String),

    #[error("no free VM id in range {start}-{end}")]
    NoCapacity { start: u32, end: u32 },

    #[error("no hypervisor nodes configured")]
    NoPlacement,

    #[error("failed to authenticate: {0}")]
    Auth(String),
}

/// Everything a provider needs to create one VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRequest {
    pub name: String,
    pub role: NodeRole,
    pub cpu: u32,
    pub memory_mib: u64,
    pub disk_mib: u64,
    /// Boot image reference (ISO volume id or image UUID)
    pub image: String,
    pub extra_disks_mib: Vec<u64>,
}

/// Reference to a created VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmHandle {
    /// Provider-specific identifier
    pub id: String,
    pub name: String,
}

/// Point-in-time view of a VM
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmStatus {
    pub healthy: bool,
    /// Empty until the provider reports an address
    pub ip: String,
}

impl VmStatus {
    pub fn is_ready(&self) -> bool {
        self.healthy && !self.ip.is_empty()
    }
}

/// Trait for infrastructure backends that can host cluster VMs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn create_vm(&self, request: &VmRequest) -> Result<VmHandle, ProviderError>;

    async fn delete_vm(&self, id: &str) -> Result<(), ProviderError>;

    async fn get_vm_status(&self, name: &str) -> Result<VmStatus, ProviderError>;

    /// Find an existing VM by name
    async fn lookup_vm(&self, name: &str) -> Result<Option<VmHandle>, ProviderError>;
}

/// Known provider identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Proxmox,
    Nutanix,
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "proxmox" => Ok(ProviderKind::Proxmox),
            "nutanix" => Ok(ProviderKind::Nutanix),
            other => Err(ConfigError::UnsupportedProvider(other.to_string())),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Proxmox => f.write_str("proxmox"),
            ProviderKind::Nutanix => f.write_str("nutanix"),
        }
    }
}

/// Build the provider named by the cluster spec
pub fn build_provider(spec: &ClusterSpec) -> Result<Arc<dyn ProviderAdapter>, ConfigError> {
    match spec.provider.parse::<ProviderKind>()? {
        ProviderKind::Proxmox => Ok(Arc::new(ProxmoxProvider::new(spec.proxmox.clone())?)),
        kind => Err(ConfigError::UnsupportedProvider(kind.to_string())),
    }
}
