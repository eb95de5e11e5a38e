//! GitOps controller hand-off
//!
//! Bootstraps the GitOps controller against the configured repository. The
//! repository token only ever travels through the tool's environment.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::kubeconfig::KubeConfigHandle;
use super::poll::sleep_or_cancel;
use crate::config::GitOpsSettings;
use crate::error::StepError;
use crate::exec::{ToolAdapter, ToolError};

pub const TOKEN_ENV: &str = "GITLAB_TOKEN";

pub const EXTRA_COMPONENTS: &str = "image-reflector-controller,image-automation-controller";

/// Supplies the repository access token for one run
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self, settings: &GitOpsSettings) -> Result<String, StepError>;
}

/// Pick the first non-empty token: environment, then configuration
pub fn resolve_token(from_env: Option<String>, configured: Option<&str>) -> Option<String> {
    from_env
        .filter(|t| !t.trim().is_empty())
        .or_else(|| configured.filter(|t| !t.trim().is_empty()).map(str::to_string))
        .map(|t| t.trim().to_string())
}

/// `GITLAB_TOKEN`, then `flux.gitPAT`, then an optional terminal prompt
pub struct EnvTokenSource {
    interactive: bool,
}

impl EnvTokenSource {
    pub fn new(interactive: bool) -> Self {
        Self { interactive }
    }
}

#[async_trait]
impl TokenSource for EnvTokenSource {
    async fn token(&self, settings: &GitOpsSettings) -> Result<String, StepError> {
        if let Some(token) = resolve_token(std::env::var(TOKEN_ENV).ok(), settings.git_pat.as_deref()) {
            return Ok(token);
        }

        if !self.interactive {
            return Err(StepError::invariant(format!(
                "no repository token: set {TOKEN_ENV} or flux.gitPAT"
            )));
        }

        warn!("Repository token not set, prompting");
        let prompted = tokio::task::spawn_blocking(|| {
            rpassword::prompt_password("Enter your GitLab token (will not be stored): ")
        })
        .await
        .map_err(|e| StepError::invariant(format!("token prompt aborted: {e}")))?
        .map_err(|e| StepError::io("read repository token", e))?;

        resolve_token(Some(prompted), None)
            .ok_or_else(|| StepError::invariant("empty repository token"))
    }
}

/// Fixed token, for callers that already hold one
pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self, _settings: &GitOpsSettings) -> Result<String, StepError> {
        Ok(self.0.clone())
    }
}

pub struct GitOpsInitializer {
    gitops: Arc<dyn ToolAdapter>,
    max_attempts: u32,
    backoff_step: Duration,
}

impl GitOpsInitializer {
    pub fn new(gitops: Arc<dyn ToolAdapter>, max_attempts: u32, backoff_step: Duration) -> Self {
        Self {
            gitops,
            max_attempts: max_attempts.max(1),
            backoff_step,
        }
    }

    fn bootstrap_args(settings: &GitOpsSettings, kubeconfig: &KubeConfigHandle) -> Vec<String> {
        let mut args = vec![
            "bootstrap".to_string(),
            "gitlab".to_string(),
        ];
        for (flag, value) in [
            ("--owner", settings.git_owner.as_str()),
            ("--repository", settings.git_repository.as_str()),
            ("--branch", settings.git_branch.as_str()),
            ("--path", settings.git_path.as_str()),
        ] {
            args.push(flag.to_string());
            args.push(value.to_string());
        }
        args.push("--token-auth=true".to_string());
        args.push("--hostname".to_string());
        args.push(settings.git_hostname.clone());
        args.push("--read-write-key=true".to_string());
        args.push("--components-extra".to_string());
        args.push(EXTRA_COMPONENTS.to_string());
        args.push("--insecure-skip-tls-verify=true".to_string());
        args.push("--kubeconfig".to_string());
        args.push(kubeconfig.path_str());
        args
    }

    /// Run the GitOps bootstrap, retrying with linear backoff between attempts
    pub async fn bootstrap(
        &self,
        cancel: &CancellationToken,
        cluster: &str,
        settings: &GitOpsSettings,
        kubeconfig: &KubeConfigHandle,
        token: &str,
    ) -> Result<(), StepError> {
        let args = Self::bootstrap_args(settings, kubeconfig);
        let env = vec![(TOKEN_ENV.to_string(), token.to_string())];
        info!(
            cluster = %cluster,
            owner = %settings.git_owner,
            repository = %settings.git_repository,
            path = %settings.git_path,
            "Starting GitOps bootstrap"
        );

        let mut last_err: Option<ToolError> = None;
        for attempt in 1..=self.max_attempts {
            info!(cluster = %cluster, attempt, "Executing GitOps bootstrap");

            match self
                .gitops
                .execute_with_env(cancel, args.clone(), env.clone())
                .await
            {
                Ok(_) => {
                    info!(cluster = %cluster, attempt, "GitOps bootstrap completed");
                    return Ok(());
                }
                Err(ToolError::Cancelled { .. }) => return Err(StepError::Cancelled),
                Err(e) => {
                    warn!(cluster = %cluster, attempt, error = %e, "GitOps bootstrap failed");
                    last_err = Some(e);
                }
            }

            if attempt < self.max_attempts {
                let backoff = self.backoff_step * attempt;
                info!(seconds = backoff.as_secs(), "Waiting before retrying");
                sleep_or_cancel(cancel, backoff).await?;
            }
        }

        error!(cluster = %cluster, attempts = self.max_attempts, "GitOps bootstrap gave up");
        let action = format!("GitOps bootstrap after {} attempts", self.max_attempts);
        match last_err {
            Some(source) => Err(StepError::tool(action, source)),
            None => Err(StepError::invariant(action)),
        }
    }
}
