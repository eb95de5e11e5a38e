//! Tests for the progress endpoints

use super::*;
use crate::bootstrap::{ProgressTracker, Stage};
use std::time::Duration;
use tokio::net::TcpListener;

/// Start the server on an ephemeral port and return its base URL
async fn start(tracker: ProgressTracker) -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let handle = tokio::spawn(async move {
        let _ = serve_status(listener, tracker).await;
    });
    (format!("http://{addr}"), handle)
}

async fn get(url: &str) -> reqwest::Response {
    reqwest::Client::new()
        .get(url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .expect("request")
}

#[tokio::test]
async fn test_healthz_returns_200() {
    let (base, server) = start(ProgressTracker::new("mgmt")).await;

    let response = get(&format!("{base}/healthz")).await;

    assert_eq!(response.status(), 200, "Liveness probe should return 200");
    server.abort();
}

#[tokio::test]
async fn test_readyz_follows_pipeline_completion() {
    // ARRANGE: a run that has not finished yet
    let tracker = ProgressTracker::new("mgmt");
    tracker.stage_started(Stage::InstallingCni);
    let (base, server) = start(tracker.clone()).await;

    // ACT + ASSERT: not ready mid-run
    let response = get(&format!("{base}/readyz")).await;
    assert_eq!(response.status(), 503);

    // ACT + ASSERT: ready once done
    tracker.finished();
    let response = get(&format!("{base}/readyz")).await;
    assert_eq!(response.status(), 200);

    server.abort();
}

#[tokio::test]
async fn test_status_reports_snapshot() {
    let tracker = ProgressTracker::new("mgmt");
    tracker.stage_started(Stage::Provisioning);
    tracker.stage_succeeded(Stage::Provisioning, Duration::from_secs(1));
    tracker.stage_started(Stage::AwaitingHealth);
    let (base, server) = start(tracker.clone()).await;

    let body: serde_json::Value = get(&format!("{base}/status")).await.json().await.unwrap();

    assert_eq!(body["cluster"], "mgmt");
    assert_eq!(body["currentStage"], "awaiting-health");
    assert_eq!(body["completedStages"][0], "provisioning");
    assert_eq!(body["runId"], tracker.run_id().to_string());
    server.abort();
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let metrics = crate::server::create_metrics().unwrap();
    let tracker = ProgressTracker::new("mgmt").with_metrics(metrics);
    tracker.stage_started(Stage::Provisioning);
    tracker.stage_succeeded(Stage::Provisioning, Duration::from_secs(3));
    let (base, server) = start(tracker).await;

    let response = get(&format!("{base}/metrics")).await;
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("butler_stage_results_total{result=\"success\",stage=\"provisioning\"} 1"));

    server.abort();
}

#[tokio::test]
async fn test_metrics_disabled_is_404() {
    let (base, server) = start(ProgressTracker::new("mgmt")).await;

    let response = get(&format!("{base}/metrics")).await;

    assert_eq!(response.status(), 404);
    server.abort();
}
