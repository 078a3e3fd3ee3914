//! Background sync loop — runs the orchestrator on a fixed interval.
//!
//! Each tick runs one `sync` pass. The returned flag both stops the loop
//! and cancels a run that is already in flight.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::SyncError;
use crate::pipeline::sync::SyncOrchestrator;
use crate::pipeline::types::CancellationFlag;

/// Spawn a background task that syncs `principal` every `interval`.
///
/// The first run starts immediately. Returns a `JoinHandle` and a shutdown
/// flag; raise the flag to stop polling.
pub fn spawn_sync_loop(
    orchestrator: Arc<SyncOrchestrator>,
    principal: String,
    max_results: usize,
    interval: Duration,
) -> (JoinHandle<()>, CancellationFlag) {
    let shutdown = CancellationFlag::new();
    let shutdown_flag = shutdown.clone();

    let handle = tokio::spawn(async move {
        info!(
            principal = %principal,
            "Sync loop started — syncing every {}s",
            interval.as_secs()
        );

        // tokio rejects a zero period
        let mut tick = tokio::time::interval(interval.max(Duration::from_millis(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;

            if shutdown.is_cancelled() {
                info!("Sync loop shutting down");
                return;
            }

            match orchestrator
                .sync_with_cancel(&principal, max_results, &shutdown)
                .await
            {
                Ok(report) if report.cancelled => {
                    info!("Sync loop shutting down mid-run");
                    return;
                }
                Ok(_) => {}
                Err(SyncError::NotConnected { principal }) => {
                    error!(principal = %principal, "Principal is not connected, stopping sync loop");
                    return;
                }
                Err(e) => error!("Sync run failed: {e}"),
            }
        }
    });

    (handle, shutdown_flag)
}
