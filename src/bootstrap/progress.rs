//! Run progress shared with the status server

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use uuid::Uuid;

use super::Stage;
use crate::server::SharedMetrics;

/// Point-in-time view of one run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub cluster: String,
    pub current_stage: Option<Stage>,
    pub completed_stages: Vec<Stage>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl RunSnapshot {
    pub fn is_done(&self) -> bool {
        self.current_stage == Some(Stage::Done)
    }
}

/// Records stage transitions for one run
///
/// Clone is cheap (Arc internally).
#[derive(Clone)]
pub struct ProgressTracker {
    state: Arc<RwLock<RunSnapshot>>,
    metrics: Option<SharedMetrics>,
}

impl ProgressTracker {
    pub fn new(cluster: &str) -> Self {
        Self {
            state: Arc::new(RwLock::new(RunSnapshot {
                run_id: Uuid::new_v4(),
                cluster: cluster.to_string(),
                current_stage: None,
                completed_stages: Vec::new(),
                started_at: Utc::now(),
                finished_at: None,
                last_error: None,
            })),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn metrics(&self) -> Option<&SharedMetrics> {
        self.metrics.as_ref()
    }

    // A panicking writer leaves a consistent snapshot behind; keep serving it
    fn read(&self) -> RwLockReadGuard<'_, RunSnapshot> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RunSnapshot> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.read().clone()
    }

    pub fn run_id(&self) -> Uuid {
        self.read().run_id
    }

    pub fn is_done(&self) -> bool {
        self.read().is_done()
    }

    pub fn stage_started(&self, stage: Stage) {
        self.write().current_stage = Some(stage);
    }

    pub fn stage_succeeded(&self, stage: Stage, elapsed: Duration) {
        self.write().completed_stages.push(stage);
        if let Some(metrics) = &self.metrics {
            metrics.record_stage(stage.as_str(), "success", elapsed.as_secs_f64());
        }
    }

    /// Record the failing stage; the run is over
    pub fn stage_failed(&self, stage: Stage, elapsed: Duration, error: &str, cancelled: bool) {
        {
            let mut state = self.write();
            state.last_error = Some(error.to_string());
            state.finished_at = Some(Utc::now());
        }
        if let Some(metrics) = &self.metrics {
            let result = if cancelled { "cancelled" } else { "error" };
            metrics.record_stage(stage.as_str(), result, elapsed.as_secs_f64());
            metrics.record_run(result);
        }
    }

    /// Configuration was rejected before any stage ran
    pub fn rejected(&self, error: &str) {
        {
            let mut state = self.write();
            state.last_error = Some(error.to_string());
            state.finished_at = Some(Utc::now());
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_run("error");
        }
    }

    pub fn finished(&self) {
        {
            let mut state = self.write();
            state.current_stage = Some(Stage::Done);
            state.finished_at = Some(Utc::now());
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_run("success");
        }
    }
}
