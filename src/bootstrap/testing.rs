//! Shared fixtures for bootstrap unit tests

use std::path::Path;
use std::sync::Arc;

use crate::config::{BootstrapConfig, ClusterSpec};
use crate::exec::fake::FakeTool;
use crate::exec::{ManifestGenerator, ToolError, Toolbox, VipManifestRequest};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub(crate) const MGMT_CONFIG: &str = r#"
managementCluster:
  name: mgmt
  provider: proxmox
  nodes:
    - role: control-plane
      count: 1
      cpu: 4
      ram: 8GB
      disk: 50GB
      isoUUID: local:iso/talos.iso
    - role: worker
      count: 2
      cpu: 8
      ram: 16GB
      disk: 100GB
      isoUUID: local:iso/talos.iso
  talos:
    version: v1.9.5
    controlPlaneEndpoint: mgmt.example.internal
    controlPlaneVIP: 10.0.0.100
  flux:
    gitOwner: platform
    gitRepository: fleet
    gitPath: clusters/mgmt
"#;

/// The `mgmt` cluster: one control plane, two workers
pub(crate) fn mgmt_spec() -> ClusterSpec {
    BootstrapConfig::from_yaml(MGMT_CONFIG)
        .expect("fixture parses")
        .management_cluster
}

pub(crate) fn mgmt_spec_in(dir: &Path) -> ClusterSpec {
    let mut spec = mgmt_spec();
    spec.work_dir = dir.to_path_buf();
    spec
}

/// Manifest generator returning fixed YAML
pub(crate) struct StaticManifest(pub &'static str);

#[async_trait]
impl ManifestGenerator for StaticManifest {
    async fn daemonset_manifest(
        &self,
        _cancel: &CancellationToken,
        _request: &VipManifestRequest,
    ) -> Result<String, ToolError> {
        Ok(self.0.to_string())
    }
}

/// Fake tools wired into a [`Toolbox`], kept around for assertions
pub(crate) struct FakeTools {
    pub os: Arc<FakeTool>,
    pub kubectl: Arc<FakeTool>,
    pub helm: Arc<FakeTool>,
    pub gitops: Arc<FakeTool>,
}

impl FakeTools {
    pub fn new(os: FakeTool, kubectl: FakeTool, helm: FakeTool, gitops: FakeTool) -> Self {
        Self {
            os: Arc::new(os),
            kubectl: Arc::new(kubectl),
            helm: Arc::new(helm),
            gitops: Arc::new(gitops),
        }
    }

    pub fn toolbox(&self) -> Toolbox {
        Toolbox {
            os: self.os.clone(),
            kubectl: self.kubectl.clone(),
            helm: self.helm.clone(),
            gitops: self.gitops.clone(),
            manifests: Arc::new(StaticManifest("kind: DaemonSet\n")),
        }
    }
}
