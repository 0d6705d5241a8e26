//! Background tasks for the Murmur server.
//!
//! Includes:
//! - Sweeping expired quota pauses and route-recreation markers.

use murmur_relay::SessionCoordinator;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

/// Starts the maintenance sweep.
///
/// Runs until `cancel` fires, calling [`SessionCoordinator::sweep`] every
/// `interval`.
pub async fn start_sweep_task(
    coordinator: Arc<SessionCoordinator>,
    interval: Duration,
    cancel: CancellationToken,
) {
    if interval.is_zero() {
        tracing::warn!("maintenance sweep disabled (interval=0)");
        return;
    }

    tracing::info!(
        interval_ms = interval.as_millis() as u64,
        "starting maintenance sweep"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(interval) => coordinator.sweep(),
        }
    }

    tracing::debug!("maintenance sweep stopped");
}
