pub mod bootstrap;
pub mod config;
pub mod error;
pub mod exec;
pub mod provider;
pub mod server;

// Re-export for main.rs and integration tests
pub use crate::bootstrap::{BootstrapService, RunSummary, Stage};
pub use crate::config::{BootstrapConfig, ClusterSpec, ConfigError};
pub use crate::error::{BootstrapError, StepError};
