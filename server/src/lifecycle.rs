//! Background lifecycle tasks.
//!
//! 1. **Heartbeat**: pings every connection at the configured interval and
//!    evicts those whose last pong is older than the timeout.
//!
//! 2. **Deadline scan**: periodically asks a [`DeadlineSource`] which
//!    notifications are due and pushes each through the producer path.
//!    Which projects qualify is the source's business, not the gateway's.

use std::future::Future;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::GatewayError;
use crate::state::AppState;
use crate::types::Notification;

/// Spawn the heartbeat sweep.
pub fn spawn_heartbeat(state: Arc<AppState>) {
    let period = state.config.heartbeat_interval;
    let timeout = state.config.heartbeat_timeout;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // First tick fires immediately; nothing can be stale yet.
        interval.tick().await;
        loop {
            interval.tick().await;
            let evicted = state.gateway.sweep(timeout);
            if evicted > 0 {
                info!(evicted, live = state.gateway.registry().len(), "heartbeat evictions");
            }
        }
    });
}

/// A notification the scan decided to send, and to whom.
#[derive(Debug, Clone)]
pub struct DueNotification {
    pub recipient: String,
    pub notification: Notification,
}

/// Supplies due notifications to the scheduled scan.
pub trait DeadlineSource: Send + Sync + 'static {
    fn due_notifications(
        &self,
    ) -> impl Future<Output = Result<Vec<DueNotification>, GatewayError>> + Send;
}

/// Spawn the deadline scan. Runs at `deadline_scan_interval`, first pass immediately.
pub fn spawn_deadline_scan<S: DeadlineSource>(state: Arc<AppState>, source: Arc<S>) {
    let period = state.config.deadline_scan_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Err(e) = run_deadline_scan(&state, source.as_ref()).await {
                warn!("deadline scan error: {e}");
            }
        }
    });
}

/// One scan pass. Returns how many notifications found a live recipient.
pub async fn run_deadline_scan<S: DeadlineSource>(
    state: &AppState,
    source: &S,
) -> Result<usize, GatewayError> {
    let due = source.due_notifications().await?;
    let mut delivered = 0;
    for item in &due {
        let payload = item.notification.to_payload()?;
        if state.gateway.notify(&item.recipient, &payload) {
            delivered += 1;
        }
    }
    if !due.is_empty() {
        info!(due = due.len(), delivered, "deadline scan pass complete");
    }
    Ok(delivered)
}
