//! Splits the VM address map into per-role IP lists

use super::health::NodeIpMap;
use super::provisioner::planned_vms;
use crate::config::{ClusterSpec, NodeRole};
use crate::error::StepError;

/// Control-plane and worker addresses, in node-group order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleIpSets {
    pub control_plane_ips: Vec<String>,
    pub worker_ips: Vec<String>,
}

impl RoleIpSets {
    /// The control-plane node every cluster-level call goes to
    pub fn bound_ip(&self) -> Option<&str> {
        self.control_plane_ips.first().map(String::as_str)
    }
}

pub fn separate_nodes_by_role(spec: &ClusterSpec, ips: &NodeIpMap) -> Result<RoleIpSets, StepError> {
    let mut sets = RoleIpSets::default();

    for vm in planned_vms(spec) {
        let ip = ips
            .get(&vm.name)
            .ok_or_else(|| StepError::invariant(format!("no IP recorded for VM {}", vm.name)))?;

        match vm.role {
            NodeRole::ControlPlane => sets.control_plane_ips.push(ip.clone()),
            NodeRole::Worker => sets.worker_ips.push(ip.clone()),
        }
    }

    if sets.control_plane_ips.is_empty() {
        return Err(StepError::invariant("no control-plane IPs"));
    }

    Ok(sets)
}
