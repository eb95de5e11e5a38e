//! Floating control-plane IP
//!
//! Renders the kube-vip daemonset, applies its upstream RBAC and then the
//! daemonset itself. Each sub-step fails with its own action name.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::kubeconfig::{KubeConfigHandle, KubectlTarget};
use crate::config::ClusterSpec;
use crate::error::StepError;
use crate::exec::{ManifestGenerator, ToolAdapter, VipManifestRequest};

pub const VIP_RBAC_URL: &str = "https://kube-vip.io/manifests/rbac.yaml";
pub const VIP_MANIFEST_FILE: &str = "kube-vip-ds.yaml";

pub struct VipInitializer {
    kubectl: Arc<dyn ToolAdapter>,
    manifests: Arc<dyn ManifestGenerator>,
}

impl VipInitializer {
    pub fn new(kubectl: Arc<dyn ToolAdapter>, manifests: Arc<dyn ManifestGenerator>) -> Self {
        Self { kubectl, manifests }
    }

    /// Install the VIP daemon through the API server at `host`
    pub async fn configure_vip(
        &self,
        cancel: &CancellationToken,
        spec: &ClusterSpec,
        kubeconfig: &KubeConfigHandle,
        host: &str,
    ) -> Result<(), StepError> {
        let request = VipManifestRequest {
            version: spec.talos.kube_vip_version.clone(),
            interface: spec.talos.network_interface.clone(),
            address: spec.talos.control_plane_vip.clone(),
        };
        info!(
            vip = %request.address,
            interface = %request.interface,
            version = %request.version,
            "Generating VIP manifest"
        );

        let manifest = self
            .manifests
            .daemonset_manifest(cancel, &request)
            .await
            .map_err(|e| StepError::tool("generate VIP manifest", e))?;

        let path = spec.work_dir.join(VIP_MANIFEST_FILE);
        tokio::fs::create_dir_all(&spec.work_dir)
            .await
            .map_err(|e| StepError::io("create work dir", e))?;
        tokio::fs::write(&path, manifest)
            .await
            .map_err(|e| StepError::io(format!("write VIP manifest {}", path.display()), e))?;
        info!(file = %path.display(), "VIP manifest saved");

        let target = KubectlTarget::new(host, &kubeconfig.path).insecure();

        info!(server = %target.server(), manifest = VIP_RBAC_URL, "Applying VIP RBAC");
        self.kubectl
            .execute(cancel, target.args(&["apply", "-f", VIP_RBAC_URL]))
            .await
            .map_err(|e| StepError::tool("apply VIP RBAC", e))?;

        let manifest_path = path.display().to_string();
        info!(server = %target.server(), manifest = %manifest_path, "Applying VIP daemonset");
        self.kubectl
            .execute(cancel, target.args(&["apply", "-f", &manifest_path]))
            .await
            .map_err(|e| StepError::tool("apply VIP daemonset", e))?;

        info!(vip = %spec.talos.control_plane_vip, "VIP daemon installed");
        Ok(())
    }
}
