use super::{argv, ToolAdapter, ToolError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Inputs for the floating-IP daemonset manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VipManifestRequest {
    pub version: String,
    pub interface: String,
    pub address: String,
}

/// Produces the VIP daemonset manifest as YAML text
#[async_trait]
pub trait ManifestGenerator: Send + Sync {
    async fn daemonset_manifest(
        &self,
        cancel: &CancellationToken,
        request: &VipManifestRequest,
    ) -> Result<String, ToolError>;
}

/// Renders the manifest by running the kube-vip image through a container runtime
pub struct ContainerManifestGenerator {
    runtime: Arc<dyn ToolAdapter>,
}

impl ContainerManifestGenerator {
    pub fn new(runtime: Arc<dyn ToolAdapter>) -> Self {
        Self { runtime }
    }

    pub(crate) fn args(request: &VipManifestRequest) -> Vec<String> {
        let image = format!("ghcr.io/kube-vip/kube-vip:{}", request.version);
        argv(&[
            "run",
            "--network",
            "host",
            "--rm",
            &image,
            "manifest",
            "daemonset",
            "--interface",
            &request.interface,
            "--address",
            &request.address,
            "--inCluster",
            "--taint",
            "--controlplane",
            "--services",
            "--arp",
            "--leaderElection",
        ])
    }
}

#[async_trait]
impl ManifestGenerator for ContainerManifestGenerator {
    async fn daemonset_manifest(
        &self,
        cancel: &CancellationToken,
        request: &VipManifestRequest,
    ) -> Result<String, ToolError> {
        self.runtime.execute(cancel, Self::args(request)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeTool;

    fn request() -> VipManifestRequest {
        VipManifestRequest {
            version: "v0.8.9".to_string(),
            interface: "ens18".to_string(),
            address: "10.0.0.100".to_string(),
        }
    }

    #[tokio::test]
    async fn test_runs_pinned_image_with_vip_flags() {
        let runtime = Arc::new(FakeTool::new("docker").respond("run", "kind: DaemonSet\n"));
        let generator = ContainerManifestGenerator::new(runtime.clone());

        let manifest = generator
            .daemonset_manifest(&CancellationToken::new(), &request())
            .await
            .unwrap();

        assert_eq!(manifest, "kind: DaemonSet\n");
        let calls = runtime.calls();
        assert_eq!(calls.len(), 1);
        let args = &calls[0].args;
        assert!(args.contains(&"ghcr.io/kube-vip/kube-vip:v0.8.9".to_string()));
        let iface = args.iter().position(|a| a == "--interface").unwrap();
        assert_eq!(args[iface + 1], "ens18");
        let addr = args.iter().position(|a| a == "--address").unwrap();
        assert_eq!(args[addr + 1], "10.0.0.100");
    }
}
