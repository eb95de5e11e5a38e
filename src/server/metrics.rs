//! Prometheus metrics for bootstrap runs
//!
//! - Stage durations
//! - Stage outcomes
//! - Whole-run outcomes

use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Pipeline metrics registry
///
/// Clone is cheap (Arc internally).
#[derive(Clone)]
pub struct PipelineMetrics {
    registry: Registry,
    /// Stage wall-clock duration in seconds
    pub stage_duration_seconds: HistogramVec,
    /// Stage outcomes by result (success, error, cancelled)
    pub stage_results_total: IntCounterVec,
    /// Pipeline runs by result
    pub pipeline_runs_total: IntCounterVec,
}

impl PipelineMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Stages range from sub-second classification to ten-minute VM waits
        let stage_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "butler_stage_duration_seconds",
                "Duration of a bootstrap stage in seconds",
            )
            .buckets(vec![0.1, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0]),
            &["stage"],
        )?;
        registry.register(Box::new(stage_duration_seconds.clone()))?;

        let stage_results_total = IntCounterVec::new(
            Opts::new(
                "butler_stage_results_total",
                "Total number of finished bootstrap stages",
            ),
            &["stage", "result"],
        )?;
        registry.register(Box::new(stage_results_total.clone()))?;

        let pipeline_runs_total = IntCounterVec::new(
            Opts::new(
                "butler_pipeline_runs_total",
                "Total number of finished bootstrap runs",
            ),
            &["result"],
        )?;
        registry.register(Box::new(pipeline_runs_total.clone()))?;

        Ok(Self {
            registry,
            stage_duration_seconds,
            stage_results_total,
            pipeline_runs_total,
        })
    }

    /// Record a finished stage
    pub fn record_stage(&self, stage: &str, result: &str, duration_secs: f64) {
        self.stage_results_total
            .with_label_values(&[stage, result])
            .inc();
        self.stage_duration_seconds
            .with_label_values(&[stage])
            .observe(duration_secs);
    }

    /// Record a finished run
    pub fn record_run(&self, result: &str) {
        self.pipeline_runs_total.with_label_values(&[result]).inc();
    }

    /// Encode all metrics to Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| {
            prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
        })
    }
}

pub type SharedMetrics = Arc<PipelineMetrics>;

pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(PipelineMetrics::new()?))
}
