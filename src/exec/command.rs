use super::{ToolAdapter, ToolError};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Runs a binary from `PATH` as a child process
///
/// The child is killed when the call is cancelled or exceeds its timeout.
#[derive(Debug, Clone)]
pub struct CommandTool {
    program: String,
    timeout: Option<Duration>,
}

impl CommandTool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl ToolAdapter for CommandTool {
    fn name(&self) -> &str {
        &self.program
    }

    async fn execute_with_env(
        &self,
        cancel: &CancellationToken,
        args: Vec<String>,
        env: Vec<(String, String)>,
    ) -> Result<String, ToolError> {
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled {
                tool: self.program.clone(),
            });
        }

        debug!(tool = %self.program, args = ?args, "Running external tool");

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|source| ToolError::Spawn {
            tool: self.program.clone(),
            source,
        })?;

        let wait = async {
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                    .await
                    .map_err(|_| ToolError::TimedOut {
                        tool: self.program.clone(),
                        timeout: limit,
                    }),
                None => Ok(child.wait_with_output().await),
            }
        };

        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ToolError::Cancelled { tool: self.program.clone() });
            }
            result = wait => result?,
        }
        .map_err(|source| ToolError::Spawn {
            tool: self.program.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(ToolError::Failed {
                tool: self.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
