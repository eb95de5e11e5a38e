//! HTTP server for run progress
//!
//! Optional during a bootstrap run:
//! - `/healthz` - Liveness probe (process is running)
//! - `/readyz` - Readiness probe (pipeline finished)
//! - `/status` - Current stage and history
//! - `/metrics` - Prometheus metrics

mod health;
mod metrics;

pub use health::{router, run_status_server, serve_status};
pub use metrics::{create_metrics, PipelineMetrics, SharedMetrics};

#[cfg(test)]
#[path = "health_test.rs"]
mod tests;

#[cfg(test)]
#[path = "metrics_test.rs"]
mod metrics_tests;
