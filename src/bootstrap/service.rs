//! Bootstrap Service: the ordered pipeline

use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use super::classifier::{separate_nodes_by_role, RoleIpSets};
use super::cni::CniInitializer;
use super::gitops::{GitOpsInitializer, TokenSource};
use super::health::{HealthChecker, NodeIpMap};
use super::kubeconfig::{ApiWait, KubeConfigManager};
use super::os::OsBootstrapInitializer;
use super::progress::ProgressTracker;
use super::provisioner::Provisioner;
use super::vip::VipInitializer;
use super::Stage;
use crate::config::ClusterSpec;
use crate::error::{BootstrapError, StepError};
use crate::exec::Toolbox;
use crate::provider::ProviderAdapter;

/// What a successful run leaves behind
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub cluster: String,
    pub node_ips: NodeIpMap,
    pub control_plane_ips: Vec<String>,
    pub worker_ips: Vec<String>,
    pub bound_ip: String,
    pub vip: String,
    pub kubeconfig: PathBuf,
}

pub struct BootstrapService {
    spec: ClusterSpec,
    provider: Arc<dyn ProviderAdapter>,
    tools: Toolbox,
    tokens: Arc<dyn TokenSource>,
    progress: ProgressTracker,
    insecure: bool,
}

impl BootstrapService {
    pub fn new(
        spec: ClusterSpec,
        provider: Arc<dyn ProviderAdapter>,
        tools: Toolbox,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        let progress = ProgressTracker::new(&spec.name);
        Self {
            spec,
            provider,
            tools,
            tokens,
            progress,
            insecure: true,
        }
    }

    pub fn with_progress(mut self, progress: ProgressTracker) -> Self {
        self.progress = progress;
        self
    }

    /// Apply OS configs over the maintenance-mode (insecure) channel. On by default.
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    async fn run_stage<T, F>(&self, stage: Stage, step: F) -> Result<T, BootstrapError>
    where
        F: Future<Output = Result<T, StepError>>,
    {
        let run_id = self.progress.run_id();
        let span = info_span!("stage", stage = %stage, run_id = %run_id);
        self.progress.stage_started(stage);
        let started = Instant::now();

        let result = async {
            info!("Stage started");
            step.await
        }
        .instrument(span.clone())
        .await;
        let elapsed = started.elapsed();

        match result {
            Ok(value) => {
                span.in_scope(|| info!(elapsed_secs = elapsed.as_secs_f64(), "Stage completed"));
                self.progress.stage_succeeded(stage, elapsed);
                Ok(value)
            }
            Err(e) => {
                let cancelled = matches!(e, StepError::Cancelled);
                span.in_scope(|| error!(error = %e, elapsed_secs = elapsed.as_secs_f64(), "Stage failed"));
                self.progress
                    .stage_failed(stage, elapsed, &e.to_string(), cancelled);
                Err(BootstrapError::at(stage, e))
            }
        }
    }

    /// Drive the cluster from no VMs to a GitOps-managed control plane
    pub async fn provision_management_cluster(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, BootstrapError> {
        let spec = &self.spec;
        if let Err(e) = spec.validate() {
            self.progress.rejected(&e.to_string());
            return Err(e.into());
        }

        let timings = &spec.timings;
        let vip = spec.talos.control_plane_vip.as_str();
        info!(
            cluster = %spec.name,
            provider = %spec.provider,
            run_id = %self.progress.run_id(),
            "Starting management cluster bootstrap"
        );

        let provisioner = Provisioner::new(self.provider.clone());
        self.run_stage(Stage::Provisioning, provisioner.provision_vms(cancel, spec))
            .await?;

        let health = HealthChecker::new(
            self.provider.clone(),
            timings.vm_poll_interval(),
            timings.vm_poll_concurrency,
        );
        let node_ips = self
            .run_stage(
                Stage::AwaitingHealth,
                health.wait_for_vms_to_be_ready(cancel, spec, timings.vm_ready_timeout()),
            )
            .await?;

        let (roles, bound_ip) = self
            .run_stage(Stage::Classifying, async {
                let roles = separate_nodes_by_role(spec, &node_ips)?;
                let bound = bound_ip(&roles)?;
                info!(
                    control_planes = roles.control_plane_ips.len(),
                    workers = roles.worker_ips.len(),
                    bound = %bound,
                    "Nodes classified"
                );
                Ok((roles, bound))
            })
            .await?;

        let os = OsBootstrapInitializer::new(
            self.tools.os.clone(),
            timings.os_registration_poll(),
            timings.os_registration_timeout(),
        );
        let mut kubeconfig = self
            .run_stage(
                Stage::OsBootstrap,
                os.configure(cancel, spec, &roles, self.insecure),
            )
            .await?;

        let manager = KubeConfigManager::new(self.tools.kubectl.clone());
        self.run_stage(Stage::ValidatingKubeconfig, async {
            manager.validate_kube_config(cancel, &kubeconfig).await?;
            manager
                .ensure_correct_context(cancel, &mut kubeconfig, &spec.name)
                .await
        })
        .await?;

        let api_wait = ApiWait {
            warmup: timings.api_warmup(),
            interval: timings.api_poll_interval(),
            timeout: timings.api_timeout(),
            refresh_window: timings.context_refresh_window(),
        };
        self.run_stage(
            Stage::AwaitingApiPreVip,
            manager.wait_for_kubernetes_api(cancel, &kubeconfig, &bound_ip, api_wait),
        )
        .await?;

        let cni = CniInitializer::new(
            self.tools.kubectl.clone(),
            self.tools.helm.clone(),
            timings.node_poll_interval(),
            timings.node_wait_timeout(),
        );
        self.run_stage(
            Stage::AwaitingNodeRegistration,
            cni.wait_for_nodes(cancel, &kubeconfig, &bound_ip),
        )
        .await?;

        // Must happen while the bound node still answers on its own address
        let ip_to_name = self
            .run_stage(
                Stage::ResolvingNodeNames,
                cni.resolve_node_names(cancel, &kubeconfig, &bound_ip),
            )
            .await?;

        let vip_init = VipInitializer::new(self.tools.kubectl.clone(), self.tools.manifests.clone());
        self.run_stage(
            Stage::ConfiguringVip,
            vip_init.configure_vip(cancel, spec, &kubeconfig, &bound_ip),
        )
        .await?;

        let vip_wait = ApiWait {
            timeout: timings.vip_api_timeout(),
            ..api_wait
        };
        self.run_stage(
            Stage::AwaitingApiPostVip,
            manager.wait_for_kubernetes_api(cancel, &kubeconfig, vip, vip_wait),
        )
        .await?;

        self.run_stage(
            Stage::LabelingNodes,
            cni.label_nodes(cancel, &kubeconfig, vip, &roles, &ip_to_name),
        )
        .await?;

        self.run_stage(
            Stage::InstallingCni,
            cni.install(cancel, &kubeconfig, vip, &roles),
        )
        .await?;

        let gitops = GitOpsInitializer::new(
            self.tools.gitops.clone(),
            timings.gitops_max_attempts,
            timings.gitops_backoff_step(),
        );
        self.run_stage(Stage::BootstrappingGitops, async {
            let token = self.tokens.token(&spec.flux).await?;
            gitops
                .bootstrap(cancel, &spec.name, &spec.flux, &kubeconfig, &token)
                .await
        })
        .await?;

        self.progress.finished();
        info!(
            cluster = %spec.name,
            kubeconfig = %kubeconfig.path.display(),
            "Management cluster bootstrap complete"
        );

        Ok(RunSummary {
            cluster: spec.name.clone(),
            node_ips,
            control_plane_ips: roles.control_plane_ips,
            worker_ips: roles.worker_ips,
            bound_ip,
            vip: vip.to_string(),
            kubeconfig: kubeconfig.path,
        })
    }
}

fn bound_ip(roles: &RoleIpSets) -> Result<String, StepError> {
    roles
        .bound_ip()
        .map(str::to_string)
        .ok_or_else(|| StepError::invariant("no control-plane IP to bind to"))
}

#[cfg(test)]
#[path = "service_test.rs"]
mod tests;
