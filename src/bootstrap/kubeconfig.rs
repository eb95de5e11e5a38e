//! Admin kubeconfig handling and API readiness

use kube::config::Kubeconfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::poll::sleep_or_cancel;
use crate::exec::{argv, ToolAdapter};
use crate::error::StepError;

/// Retrieved admin credential file and the context it should use
///
/// Left on disk after the run for the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeConfigHandle {
    pub path: PathBuf,
    pub context: String,
}

impl KubeConfigHandle {
    pub fn new(path: impl Into<PathBuf>, cluster: &str) -> Self {
        Self {
            path: path.into(),
            context: admin_context(cluster),
        }
    }

    pub fn path_str(&self) -> String {
        self.path.display().to_string()
    }
}

pub fn admin_context(cluster: &str) -> String {
    format!("admin@{cluster}")
}

pub fn api_server(host: &str) -> String {
    format!("https://{host}:6443")
}

/// A kubectl invocation pinned to one API server and kubeconfig
#[derive(Debug, Clone)]
pub struct KubectlTarget {
    server: String,
    kubeconfig: String,
    insecure: bool,
}

impl KubectlTarget {
    pub fn new(host: &str, kubeconfig: &Path) -> Self {
        Self {
            server: api_server(host),
            kubeconfig: kubeconfig.display().to_string(),
            insecure: false,
        }
    }

    /// Skip TLS verification; the floating IP is not always in the serving cert
    pub fn insecure(mut self) -> Self {
        self.insecure = true;
        self
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn args(&self, rest: &[&str]) -> Vec<String> {
        let mut args = argv(&["--server", &self.server, "--kubeconfig", &self.kubeconfig]);
        args.extend(rest.iter().map(|s| s.to_string()));
        if self.insecure {
            args.push("--insecure-skip-tls-verify=true".to_string());
        }
        args
    }
}

/// Timing for one API readiness wait
#[derive(Debug, Clone, Copy)]
pub struct ApiWait {
    /// Fixed delay before the first probe
    pub warmup: Duration,
    pub interval: Duration,
    pub timeout: Duration,
    /// How close to the deadline the context gets refreshed
    pub refresh_window: Duration,
}

pub struct KubeConfigManager {
    kubectl: Arc<dyn ToolAdapter>,
}

impl KubeConfigManager {
    pub fn new(kubectl: Arc<dyn ToolAdapter>) -> Self {
        Self { kubectl }
    }

    /// Check the file exists, parses, and is accepted by kubectl
    pub async fn validate_kube_config(
        &self,
        cancel: &CancellationToken,
        handle: &KubeConfigHandle,
    ) -> Result<(), StepError> {
        info!(path = %handle.path.display(), "Validating kubeconfig");

        if !handle.path.exists() {
            return Err(StepError::invariant(format!(
                "kubeconfig file missing: {}",
                handle.path.display()
            )));
        }

        let parsed = Kubeconfig::read_from(&handle.path).map_err(|e| {
            StepError::invariant(format!(
                "kubeconfig {} is not valid: {e}",
                handle.path.display()
            ))
        })?;
        if !parsed.contexts.iter().any(|c| c.name == handle.context) {
            warn!(
                path = %handle.path.display(),
                context = %handle.context,
                "Expected context not present in kubeconfig"
            );
        }

        let path = handle.path_str();
        self.kubectl
            .execute(cancel, argv(&["--kubeconfig", &path, "config", "view"]))
            .await
            .map_err(|e| StepError::tool("kubectl config view", e))?;

        info!(path = %path, "Kubeconfig is valid");
        Ok(())
    }

    /// Switch the kubeconfig to `admin@{cluster}` and verify it stuck
    pub async fn ensure_correct_context(
        &self,
        cancel: &CancellationToken,
        handle: &mut KubeConfigHandle,
        cluster: &str,
    ) -> Result<(), StepError> {
        handle.context = admin_context(cluster);
        let path = handle.path_str();

        if let Err(e) = self
            .kubectl
            .execute(
                cancel,
                argv(&["--kubeconfig", &path, "config", "unset", "current-context"]),
            )
            .await
        {
            if cancel.is_cancelled() {
                return Err(StepError::Cancelled);
            }
            warn!(error = %e, "Failed to unset current-context");
        }

        self.kubectl
            .execute(
                cancel,
                argv(&["--kubeconfig", &path, "config", "use-context", &handle.context]),
            )
            .await
            .map_err(|e| StepError::tool("switch kubeconfig context", e))?;

        let current = self
            .kubectl
            .execute(cancel, argv(&["--kubeconfig", &path, "config", "current-context"]))
            .await
            .map_err(|e| StepError::tool("read current kubeconfig context", e))?;

        if current.trim() != handle.context {
            return Err(StepError::invariant(format!(
                "kubeconfig context is {:?}, expected {:?}",
                current.trim(),
                handle.context
            )));
        }

        info!(context = %handle.context, "Kubeconfig context set");
        Ok(())
    }

    /// Wait until `get nodes` succeeds against `host`
    ///
    /// Once inside the refresh window before the deadline, each failed probe
    /// also re-checks the kubeconfig and reselects the admin context if kubectl
    /// rejects it.
    pub async fn wait_for_kubernetes_api(
        &self,
        cancel: &CancellationToken,
        handle: &KubeConfigHandle,
        host: &str,
        wait: ApiWait,
    ) -> Result<(), StepError> {
        info!(warmup_secs = wait.warmup.as_secs(), "Giving the Kubernetes API time to start");
        sleep_or_cancel(cancel, wait.warmup).await?;

        let target = KubectlTarget::new(host, &handle.path);
        let deadline = Instant::now() + wait.timeout;
        let refresh_from = deadline.checked_sub(wait.refresh_window).unwrap_or(deadline);
        info!(server = %target.server(), "Waiting for Kubernetes API");

        while Instant::now() < deadline {
            match self
                .kubectl
                .execute(cancel, target.args(&["get", "nodes", "--request-timeout=15s"]))
                .await
            {
                Ok(_) => {
                    info!(server = %target.server(), "Kubernetes API is ready");
                    return Ok(());
                }
                Err(e) => {
                    if cancel.is_cancelled() {
                        return Err(StepError::Cancelled);
                    }
                    warn!(server = %target.server(), error = %e, "Kubernetes API not ready yet");
                }
            }

            if Instant::now() >= refresh_from {
                self.refresh_context(cancel, &target, handle).await;
            }

            sleep_or_cancel(cancel, wait.interval).await?;
        }

        Err(StepError::timeout(format!("Kubernetes API on {host}")))
    }

    async fn refresh_context(
        &self,
        cancel: &CancellationToken,
        target: &KubectlTarget,
        handle: &KubeConfigHandle,
    ) {
        if self
            .kubectl
            .execute(cancel, target.args(&["config", "view"]))
            .await
            .is_ok()
        {
            return;
        }

        warn!(context = %handle.context, "Kubeconfig rejected, reselecting context");
        let _ = self
            .kubectl
            .execute(cancel, target.args(&["config", "unset", "current-context"]))
            .await;
        let _ = self
            .kubectl
            .execute(cancel, target.args(&["config", "use-context", &handle.context]))
            .await;
    }
}

#[cfg(test)]
#[path = "kubeconfig_test.rs"]
mod tests;
