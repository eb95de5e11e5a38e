//! External tool adapters
//!
//! Every tool the pipeline drives (OS tool, kubectl, helm, GitOps CLI,
//! container runtime) sits behind one [`ToolAdapter`] signature: named
//! binary, arguments in, captured stdout or an error out. Stage components
//! never see a concrete binding.

mod command;
mod manifest;

pub use command::CommandTool;
pub use manifest::{ContainerManifestGenerator, ManifestGenerator, VipManifestRequest};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("{tool} did not finish within {timeout:?}")]
    TimedOut { tool: String, timeout: Duration },

    #[error("{tool} was cancelled")]
    Cancelled { tool: String },
}

/// Something that runs a named external tool and returns its stdout
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Binary name, for logs and errors
    fn name(&self) -> &str;

    /// Run the tool with extra environment variables for this call only
    async fn execute_with_env(
        &self,
        cancel: &CancellationToken,
        args: Vec<String>,
        env: Vec<(String, String)>,
    ) -> Result<String, ToolError>;

    /// Run the tool
    async fn execute(
        &self,
        cancel: &CancellationToken,
        args: Vec<String>,
    ) -> Result<String, ToolError> {
        self.execute_with_env(cancel, args, Vec::new()).await
    }
}

/// Build an owned argument vector from borrowed parts
pub fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

/// The tools a bootstrap run drives
#[derive(Clone)]
pub struct Toolbox {
    /// Immutable-OS bootstrap tool (talosctl)
    pub os: Arc<dyn ToolAdapter>,
    pub kubectl: Arc<dyn ToolAdapter>,
    /// Chart installer (helm)
    pub helm: Arc<dyn ToolAdapter>,
    /// GitOps CLI (flux)
    pub gitops: Arc<dyn ToolAdapter>,
    /// Renders the floating-IP daemonset manifest
    pub manifests: Arc<dyn ManifestGenerator>,
}

impl Toolbox {
    /// Bind every adapter to the binaries on `PATH`
    pub fn system(tool_timeout: Duration) -> Self {
        let runtime: Arc<dyn ToolAdapter> =
            Arc::new(CommandTool::new("docker").with_timeout(tool_timeout));

        Self {
            os: Arc::new(CommandTool::new("talosctl").with_timeout(tool_timeout)),
            kubectl: Arc::new(CommandTool::new("kubectl").with_timeout(tool_timeout)),
            helm: Arc::new(CommandTool::new("helm").with_timeout(tool_timeout)),
            gitops: Arc::new(CommandTool::new("flux").with_timeout(tool_timeout)),
            manifests: Arc::new(ContainerManifestGenerator::new(runtime)),
        }
    }
}

#[cfg(test)]
pub(crate) mod fake;
