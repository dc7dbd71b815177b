//! Scheduled background tasks.
//!
//! ```text
//! SubscriptionRefreshTask (every SUBSCRIPTION_REFRESH_INTERVAL_SECS)
//!     │
//!     └─► AdmissionController::refresh_all_subscriptions()
//!             └─► For each organization → billing lookup → quota row update
//! ```
//!
//! The task owns a cancellation token. A refresh that already started runs to
//! completion before the token is honoured; shutdown awaits the handle.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::domains::admission::AdmissionController;

/// Reference refresh interval.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10 * 60);

pub struct SubscriptionRefreshTask;

impl SubscriptionRefreshTask {
    pub fn spawn(
        admission: Arc<AdmissionController>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // Skip first immediate tick

            tracing::info!(interval_secs = interval.as_secs(), "subscription refresh task started");

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => run_refresh(&admission).await,
                }
            }

            tracing::info!("subscription refresh task stopped");
        })
    }
}

async fn run_refresh(admission: &AdmissionController) {
    match admission.refresh_all_subscriptions().await {
        Ok(count) => tracing::info!(count, "subscriptions refreshed"),
        Err(e) => tracing::error!(error = %e, "subscription refresh failed"),
    }
}
