//! Progress endpoints for a running bootstrap
//!
//! - `/healthz` - Liveness: is the process alive?
//! - `/readyz` - Readiness: has the pipeline reached `done`?
//! - `/status` - JSON snapshot of the run
//! - `/metrics` - Prometheus text format

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::bootstrap::ProgressTracker;

/// Liveness probe handler
///
/// Always returns 200 OK - if this responds, the process is alive.
async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Returns 200 OK once the run is done, 503 Service Unavailable before that.
async fn readyz(State(tracker): State<ProgressTracker>) -> StatusCode {
    if tracker.is_done() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn status(State(tracker): State<ProgressTracker>) -> Response {
    Json(tracker.snapshot()).into_response()
}

async fn metrics(State(tracker): State<ProgressTracker>) -> Response {
    let Some(metrics) = tracker.metrics() else {
        return (StatusCode::NOT_FOUND, "metrics disabled").into_response();
    };

    match metrics.encode() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn router(tracker: ProgressTracker) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .with_state(tracker)
}

/// Serve the progress endpoints on an already bound listener
pub async fn serve_status(listener: TcpListener, tracker: ProgressTracker) -> Result<(), std::io::Error> {
    axum::serve(listener, router(tracker))
        .await
        .map_err(std::io::Error::other)
}

/// Run the status server on the specified port until the task is dropped
pub async fn run_status_server(port: u16, tracker: ProgressTracker) -> Result<(), std::io::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    // Log after successful bind - server is actually listening
    info!(port = %port, "Status server listening");

    serve_status(listener, tracker).await
}
