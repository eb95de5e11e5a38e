//! Node operating system bootstrap
//!
//! Drives the OS tool through config generation, config apply, control-plane
//! bootstrap and kubeconfig retrieval. Everything it writes lands in the
//! cluster work directory.

use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::classifier::RoleIpSets;
use super::kubeconfig::KubeConfigHandle;
use super::poll::poll_until;
use crate::config::ClusterSpec;
use crate::error::StepError;
use crate::exec::{argv, ToolAdapter};

pub const CONTROL_PLANE_CONFIG: &str = "controlplane.yaml";
pub const WORKER_CONFIG: &str = "worker.yaml";
pub const CLIENT_CONFIG: &str = "talosconfig";
pub const KUBECONFIG: &str = "kubeconfig";

/// Pod CIDR handed to the network plugin
pub const POD_SUBNET: &str = "10.16.0.0/16";

/// JSON patch applied to every generated machine config
///
/// Disables the built-in time sync, loads openvswitch, leaves CNI to the
/// chart install and bind-mounts the OVS/OVN runtime directories.
pub fn machine_config_patch() -> serde_json::Value {
    let mounts: Vec<_> = [
        "/run/openvswitch",
        "/run/ovn",
        "/var/log/openvswitch",
        "/var/log/ovn",
    ]
    .iter()
    .map(|dir| {
        json!({
            "source": dir,
            "destination": dir,
            "type": "bind",
            "options": ["rbind", "rw"],
        })
    })
    .collect();

    json!([
        { "op": "replace", "path": "/machine/time", "value": { "disabled": true } },
        {
            "op": "add",
            "path": "/machine/kernel",
            "value": { "modules": [{ "name": "openvswitch" }] }
        },
        { "op": "add", "path": "/cluster/network/cni", "value": { "name": "none" } },
        { "op": "replace", "path": "/cluster/network/podSubnets", "value": [POD_SUBNET] },
        { "op": "add", "path": "/machine/kubelet/extraMounts", "value": mounts },
    ])
}

/// `https://host:6443` unless the endpoint already names a port
pub fn cluster_endpoint_url(endpoint: &str) -> String {
    let host = endpoint
        .trim()
        .trim_start_matches("https://")
        .trim_end_matches('/');
    let has_port = host
        .rsplit_once(':')
        .is_some_and(|(_, port)| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()));

    if has_port {
        format!("https://{host}")
    } else {
        format!("https://{host}:6443")
    }
}

pub struct OsBootstrapInitializer {
    os: Arc<dyn ToolAdapter>,
    registration_poll: Duration,
    registration_timeout: Duration,
}

impl OsBootstrapInitializer {
    pub fn new(os: Arc<dyn ToolAdapter>, registration_poll: Duration, registration_timeout: Duration) -> Self {
        Self {
            os,
            registration_poll,
            registration_timeout,
        }
    }

    /// Install and bootstrap the OS on every node, returning the admin kubeconfig
    pub async fn configure(
        &self,
        cancel: &CancellationToken,
        spec: &ClusterSpec,
        roles: &RoleIpSets,
        insecure: bool,
    ) -> Result<KubeConfigHandle, StepError> {
        let bound = roles
            .bound_ip()
            .ok_or_else(|| StepError::invariant("no control-plane IPs"))?;
        let dir = &spec.work_dir;
        let talosconfig = dir.join(CLIENT_CONFIG).display().to_string();

        info!(cluster = %spec.name, endpoint = %spec.talos.control_plane_endpoint, "Starting OS bootstrap");

        self.generate_config(cancel, spec).await?;

        for ip in &roles.control_plane_ips {
            self.apply_config(cancel, ip, &dir.join(CONTROL_PLANE_CONFIG), &talosconfig, insecure)
                .await?;
        }
        for ip in &roles.worker_ips {
            self.apply_config(cancel, ip, &dir.join(WORKER_CONFIG), &talosconfig, insecure)
                .await?;
        }

        self.wait_for_registration(cancel, bound, &talosconfig).await?;

        info!(node = %bound, "Setting OS client endpoint");
        self.os
            .execute(
                cancel,
                argv(&["config", "endpoint", bound, "--talosconfig", &talosconfig]),
            )
            .await
            .map_err(|e| StepError::tool(format!("set OS endpoint to {bound}"), e))?;

        info!(node = %bound, "Bootstrapping control plane");
        self.os
            .execute(
                cancel,
                argv(&["bootstrap", "--nodes", bound, "--talosconfig", &talosconfig]),
            )
            .await
            .map_err(|e| StepError::tool(format!("bootstrap control plane on {bound}"), e))?;

        let kubeconfig = dir.join(KUBECONFIG);
        let kubeconfig_arg = kubeconfig.display().to_string();
        info!(node = %bound, path = %kubeconfig_arg, "Retrieving kubeconfig");
        self.os
            .execute(
                cancel,
                argv(&[
                    "kubeconfig",
                    &kubeconfig_arg,
                    "--nodes",
                    bound,
                    "--talosconfig",
                    &talosconfig,
                    "--force",
                    "--merge",
                ]),
            )
            .await
            .map_err(|e| StepError::tool("retrieve kubeconfig", e))?;

        info!(cluster = %spec.name, "OS bootstrap complete");
        Ok(KubeConfigHandle::new(kubeconfig, &spec.name))
    }

    async fn generate_config(&self, cancel: &CancellationToken, spec: &ClusterSpec) -> Result<(), StepError> {
        let dir = &spec.work_dir;
        if generated(dir).await {
            info!(dir = %dir.display(), "OS configs already generated, reusing");
            return Ok(());
        }

        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| StepError::io(format!("create work dir {}", dir.display()), e))?;

        let endpoint = cluster_endpoint_url(&spec.talos.control_plane_endpoint);
        let output = dir.display().to_string();
        let patch = machine_config_patch().to_string();
        info!(cluster = %spec.name, endpoint = %endpoint, "Generating OS configuration");

        let mut args = argv(&[
            "gen",
            "config",
            &spec.name,
            &endpoint,
            "--output",
            &output,
            "--config-patch",
            &patch,
        ]);
        if !spec.talos.version.is_empty() {
            args.push("--talos-version".to_string());
            args.push(spec.talos.version.clone());
        }

        self.os
            .execute(cancel, args)
            .await
            .map_err(|e| StepError::tool("generate OS config", e))?;
        Ok(())
    }

    async fn apply_config(
        &self,
        cancel: &CancellationToken,
        node: &str,
        file: &Path,
        talosconfig: &str,
        insecure: bool,
    ) -> Result<(), StepError> {
        let file = file.display().to_string();
        info!(node = %node, file = %file, "Applying OS config");

        let mut args = argv(&[
            "apply-config",
            "--nodes",
            node,
            "--file",
            &file,
            "--talosconfig",
            talosconfig,
        ]);
        if insecure {
            args.push("--insecure".to_string());
        }

        self.os
            .execute(cancel, args)
            .await
            .map_err(|e| StepError::tool(format!("apply OS config to {node}"), e))?;
        Ok(())
    }

    /// Poll the control-plane OS API until it answers with the applied config
    async fn wait_for_registration(
        &self,
        cancel: &CancellationToken,
        node: &str,
        talosconfig: &str,
    ) -> Result<(), StepError> {
        info!(
            node = %node,
            timeout_secs = self.registration_timeout.as_secs(),
            "Waiting for OS to register"
        );
        let os = &self.os;
        let args = argv(&["version", "--nodes", node, "--endpoints", node, "--talosconfig", talosconfig]);
        let args = &args;

        poll_until(
            cancel,
            self.registration_poll,
            self.registration_timeout,
            &format!("OS registration on {node}"),
            move || async move { os.execute(cancel, args.clone()).await.ok().map(|_| ()) },
        )
        .await
    }
}

async fn generated(dir: &Path) -> bool {
    for file in [CONTROL_PLANE_CONFIG, WORKER_CONFIG, CLIENT_CONFIG] {
        if !tokio::fs::try_exists(dir.join(file)).await.unwrap_or(false) {
            return false;
        }
    }
    true
}

#[cfg(test)]
#[path = "os_test.rs"]
mod tests;
