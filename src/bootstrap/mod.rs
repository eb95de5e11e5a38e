//! Management-cluster bootstrap pipeline
//!
//! Stage components live in their own modules and only see adapter traits.
//! [`BootstrapService`] wires them together and runs them strictly in
//! [`Stage`] order.

pub mod classifier;
pub mod cni;
pub mod gitops;
pub mod health;
pub mod kubeconfig;
pub mod os;
mod poll;
pub mod progress;
pub mod provisioner;
mod service;
pub mod vip;

#[cfg(test)]
pub(crate) mod testing;

pub use classifier::{separate_nodes_by_role, RoleIpSets};
pub use gitops::{EnvTokenSource, StaticToken, TokenSource};
pub use health::NodeIpMap;
pub use kubeconfig::KubeConfigHandle;
pub use progress::{ProgressTracker, RunSnapshot};
pub use provisioner::{vm_names, Provisioner};
pub use service::{BootstrapService, RunSummary};

use serde::Serialize;
use std::fmt;

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Provisioning,
    AwaitingHealth,
    Classifying,
    OsBootstrap,
    ValidatingKubeconfig,
    AwaitingApiPreVip,
    AwaitingNodeRegistration,
    ResolvingNodeNames,
    ConfiguringVip,
    AwaitingApiPostVip,
    LabelingNodes,
    InstallingCni,
    BootstrappingGitops,
    Done,
}

impl Stage {
    pub const ALL: [Stage; 14] = [
        Stage::Provisioning,
        Stage::AwaitingHealth,
        Stage::Classifying,
        Stage::OsBootstrap,
        Stage::ValidatingKubeconfig,
        Stage::AwaitingApiPreVip,
        Stage::AwaitingNodeRegistration,
        Stage::ResolvingNodeNames,
        Stage::ConfiguringVip,
        Stage::AwaitingApiPostVip,
        Stage::LabelingNodes,
        Stage::InstallingCni,
        Stage::BootstrappingGitops,
        Stage::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Provisioning => "provisioning",
            Stage::AwaitingHealth => "awaiting-health",
            Stage::Classifying => "classifying",
            Stage::OsBootstrap => "os-bootstrap",
            Stage::ValidatingKubeconfig => "validating-kubeconfig",
            Stage::AwaitingApiPreVip => "awaiting-api-pre-vip",
            Stage::AwaitingNodeRegistration => "awaiting-node-registration",
            Stage::ResolvingNodeNames => "resolving-node-names",
            Stage::ConfiguringVip => "configuring-vip",
            Stage::AwaitingApiPostVip => "awaiting-api-post-vip",
            Stage::LabelingNodes => "labeling-nodes",
            Stage::InstallingCni => "installing-cni",
            Stage::BootstrappingGitops => "bootstrapping-gitops",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
