//! VM planning and creation
//!
//! Names are derived as `{cluster}-{role}-{i}` with `i` starting at 1. When a
//! role appears in more than one node group the index keeps counting, so every
//! derived name is unique.

use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{parse_size_mib, ClusterSpec, ConfigError, NodeRole};
use crate::error::StepError;
use crate::provider::{ProviderAdapter, VmHandle, VmRequest};

/// One VM the cluster asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedVm {
    pub name: String,
    pub role: NodeRole,
    /// Index of the node group it came from
    pub group: usize,
}

pub fn vm_name(cluster: &str, role: NodeRole, index: u32) -> String {
    format!("{}-{}-{}", cluster, role.as_str(), index)
}

/// Every VM the cluster derives, in node-group order
pub fn planned_vms(spec: &ClusterSpec) -> Vec<PlannedVm> {
    let mut next_index: HashMap<NodeRole, u32> = HashMap::new();
    let mut planned = Vec::new();

    for (group_index, group) in spec.nodes.iter().enumerate() {
        let counter = next_index.entry(group.role).or_insert(0);
        for _ in 0..group.count {
            *counter += 1;
            planned.push(PlannedVm {
                name: vm_name(&spec.name, group.role, *counter),
                role: group.role,
                group: group_index,
            });
        }
    }

    planned
}

pub fn vm_names(spec: &ClusterSpec) -> Vec<String> {
    planned_vms(spec).into_iter().map(|vm| vm.name).collect()
}

/// Translate node groups into provider requests, sizes in MiB
pub fn build_vm_requests(spec: &ClusterSpec) -> Result<Vec<VmRequest>, ConfigError> {
    planned_vms(spec)
        .into_iter()
        .map(|vm| {
            let group = &spec.nodes[vm.group];
            Ok(VmRequest {
                name: vm.name,
                role: vm.role,
                cpu: group.cpu,
                memory_mib: parse_size_mib(&group.ram)?,
                disk_mib: parse_size_mib(&group.disk)?,
                image: group.iso_uuid.clone(),
                extra_disks_mib: group
                    .extra_disks
                    .iter()
                    .map(|disk| parse_size_mib(disk))
                    .collect::<Result<_, _>>()?,
            })
        })
        .collect()
}

/// Creates the VMs a cluster asks for
pub struct Provisioner {
    provider: Arc<dyn ProviderAdapter>,
}

impl Provisioner {
    pub fn new(provider: Arc<dyn ProviderAdapter>) -> Self {
        Self { provider }
    }

    /// Create every VM in the spec, stopping at the first failure
    ///
    /// VMs that already exist under their derived name are left alone, so a
    /// failed run can be re-run without cleaning up first.
    pub async fn provision_vms(
        &self,
        cancel: &CancellationToken,
        spec: &ClusterSpec,
    ) -> Result<Vec<VmHandle>, StepError> {
        let requests = build_vm_requests(spec)
            .map_err(|e| StepError::invariant(format!("unvalidated node sizes: {e}")))?;
        let mut handles = Vec::with_capacity(requests.len());

        for request in &requests {
            if cancel.is_cancelled() {
                return Err(StepError::Cancelled);
            }

            let resource = format!("VM {}", request.name);
            let existing = self
                .provider
                .lookup_vm(&request.name)
                .await
                .map_err(|source| StepError::Provider {
                    resource: resource.clone(),
                    source,
                })?;

            if let Some(handle) = existing {
                info!(vm = %request.name, id = %handle.id, "VM already exists, skipping create");
                handles.push(handle);
                continue;
            }

            let handle = self
                .provider
                .create_vm(request)
                .await
                .map_err(|source| StepError::Provider { resource, source })?;
            info!(vm = %handle.name, id = %handle.id, role = %request.role, "VM created");
            handles.push(handle);
        }

        Ok(handles)
    }

    /// Delete every derived VM that exists, returning the names removed
    pub async fn destroy_vms(
        &self,
        cancel: &CancellationToken,
        spec: &ClusterSpec,
    ) -> Result<Vec<String>, StepError> {
        let mut removed = Vec::new();

        for name in vm_names(spec) {
            if cancel.is_cancelled() {
                return Err(StepError::Cancelled);
            }

            let resource = format!("VM {name}");
            let existing = self
                .provider
                .lookup_vm(&name)
                .await
                .map_err(|source| StepError::Provider {
                    resource: resource.clone(),
                    source,
                })?;

            let Some(handle) = existing else {
                warn!(vm = %name, "VM not found, nothing to delete");
                continue;
            };

            // delete_vm polls until the VM stops
            tokio::select! {
                _ = cancel.cancelled() => return Err(StepError::Cancelled),
                result = self.provider.delete_vm(&handle.id) => {
                    result.map_err(|source| StepError::Provider { resource, source })?;
                }
            }
            info!(vm = %name, id = %handle.id, "VM deleted");
            removed.push(name);
        }

        Ok(removed)
    }
}

#[cfg(test)]
#[path = "provisioner_test.rs"]
mod tests;
