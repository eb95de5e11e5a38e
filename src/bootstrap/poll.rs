//! Deadline-bounded polling shared by the waiting stages

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::StepError;

/// Sleep for `duration` unless the run is cancelled first
pub async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> Result<(), StepError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(StepError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Re-run `check` every `interval` until it yields a value or `timeout` passes
///
/// The check always runs once more at the deadline, so a resource that
/// converges during the final sleep is still seen.
pub async fn poll_until<T, F, Fut>(
    cancel: &CancellationToken,
    interval: Duration,
    timeout: Duration,
    resource: &str,
    mut check: F,
) -> Result<T, StepError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + timeout;

    loop {
        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        if let Some(value) = check().await {
            return Ok(value);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(StepError::timeout(resource));
        }
        sleep_or_cancel(cancel, interval.min(deadline - now)).await?;
    }
}
