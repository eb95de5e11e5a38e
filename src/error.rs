//! Error taxonomy for a bootstrap run
//!
//! Stage components return [`StepError`]; the orchestrator attaches the stage
//! that was running and hands a [`BootstrapError`] back to the caller.

use crate::bootstrap::Stage;
use crate::config::ConfigError;
use crate::exec::ToolError;
use crate::provider::ProviderError;
use thiserror::Error;

/// Failure inside a single stage
#[derive(Debug, Error)]
pub enum StepError {
    /// A polled resource never converged before its deadline
    #[error("timed out waiting for {resource}")]
    Timeout { resource: String },

    /// A one-shot external tool invocation failed
    #[error("{action} failed: {source}")]
    Tool {
        action: String,
        #[source]
        source: ToolError,
    },

    /// Provider call failed outside of a polling loop
    #[error("provider call for {resource} failed: {source}")]
    Provider {
        resource: String,
        #[source]
        source: ProviderError,
    },

    /// An earlier stage produced inconsistent output
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("{action}: {source}")]
    Io {
        action: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to render {name}: {message}")]
    Render { name: String, message: String },

    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    /// Wrap a tool failure; a cancelled tool call reports as [`StepError::Cancelled`]
    pub fn tool(action: impl Into<String>, source: ToolError) -> Self {
        match source {
            ToolError::Cancelled { .. } => StepError::Cancelled,
            source => StepError::Tool {
                action: action.into(),
                source,
            },
        }
    }

    pub fn timeout(resource: impl Into<String>) -> Self {
        StepError::Timeout {
            resource: resource.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        StepError::Invariant(message.into())
    }

    pub fn io(action: impl Into<String>, source: std::io::Error) -> Self {
        StepError::Io {
            action: action.into(),
            source,
        }
    }
}

/// Error returned to whoever invoked the pipeline
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("stage {stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: StepError,
    },
}

impl BootstrapError {
    pub fn at(stage: Stage, source: StepError) -> Self {
        BootstrapError::Stage { stage, source }
    }

    /// Stage the run failed in, if it got past configuration
    pub fn stage(&self) -> Option<Stage> {
        match self {
            BootstrapError::Config(_) => None,
            BootstrapError::Stage { stage, .. } => Some(*stage),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            BootstrapError::Stage {
                source: StepError::Timeout { .. },
                ..
            }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            BootstrapError::Stage {
                source: StepError::Cancelled,
                ..
            }
        )
    }
}
