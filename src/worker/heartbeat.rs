//! Exchange heartbeat

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::exchange::Exchange;

/// Spawn the periodic heartbeat task.
///
/// Failures are logged and retried on the next interval.
pub fn spawn_heartbeat_task(exchange: Arc<dyn Exchange>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            device_id = %exchange.device_id(),
            interval_secs = interval.as_secs(),
            "Exchange heartbeat task started"
        );

        loop {
            tokio::time::sleep(interval).await;

            match exchange.heartbeat().await {
                Ok(()) => debug!("Heartbeat sent"),
                Err(e) => warn!(
                    device_id = %exchange.device_id(),
                    error = %e,
                    "Failed to send heartbeat (will retry next interval)"
                ),
            }
        }
    })
}
