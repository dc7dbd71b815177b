//! Per-organization admission: subscription gate, trial quota, paid overage.
//!
//! ```text
//! consume_quota_if_available(org)
//!     ├─► unknown org / no access ─────────────► SubscriptionDenied
//!     ├─► trial ──► atomic daily unit ──ok──► Allowed { over_quota: false }
//!     │                  └─exhausted───────► QuotaExceeded
//!     └─► paid ───► atomic monthly unit ──► Allowed { over_quota }
//!                        ├─ over limit ──► report_overage_usage(org, 1)
//!                        └─ past cap ────► OverageCapReached
//! ```
//!
//! Nothing here returns an error to the caller. Storage failures become
//! [`QuotaDecision::Unavailable`] and billing failures are logged.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::models::QuotaState;
use super::store::QuotaStore;
use crate::kernel::traits::BaseBillingProvider;

/// Outcome of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum QuotaDecision {
    Allowed { over_quota: bool },
    /// Trial allotment for today is used up.
    QuotaExceeded,
    /// Paid usage hit the configured overage cap for this billing period.
    OverageCapReached,
    /// No subscription and no running trial.
    SubscriptionDenied,
    /// Quota storage could not be reached.
    Unavailable,
}

impl QuotaDecision {
    pub fn allowed(&self) -> bool {
        matches!(self, QuotaDecision::Allowed { .. })
    }

    pub fn over_quota(&self) -> bool {
        matches!(self, QuotaDecision::Allowed { over_quota: true })
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    /// Monthly allotment applied to every active subscription.
    pub paid_monthly_limit: i32,
    /// Units allowed beyond `paid_monthly_limit`. `None` means unlimited.
    pub overage_hard_cap: Option<i32>,
    pub trial_days: i64,
    pub trial_daily_limit: i32,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            paid_monthly_limit: 500,
            overage_hard_cap: None,
            trial_days: 14,
            trial_daily_limit: 10,
        }
    }
}

/// Upper bound on one overage report to billing.
pub const OVERAGE_REPORT_TIMEOUT: StdDuration = StdDuration::from_secs(3);

pub struct AdmissionController {
    store: Arc<dyn QuotaStore>,
    billing: Arc<dyn BaseBillingProvider>,
    policy: AdmissionPolicy,
}

impl AdmissionController {
    pub fn new(
        store: Arc<dyn QuotaStore>,
        billing: Arc<dyn BaseBillingProvider>,
        policy: AdmissionPolicy,
    ) -> Self {
        Self {
            store,
            billing,
            policy,
        }
    }

    /// Storage-only check: active subscription, or a trial that has not ended.
    pub async fn has_access(&self, org_id: Uuid) -> bool {
        match self.store.find(org_id).await {
            Ok(Some(state)) => state.has_access(Utc::now()),
            Ok(None) => false,
            Err(e) => {
                error!(org_id = %org_id, error = %e, "quota lookup failed");
                false
            }
        }
    }

    pub async fn consume_quota_if_available(&self, org_id: Uuid) -> QuotaDecision {
        let now = Utc::now();
        let state = match self.store.find(org_id).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                info!(org_id = %org_id, "no quota row for organization");
                return QuotaDecision::SubscriptionDenied;
            }
            Err(e) => {
                error!(org_id = %org_id, error = %e, "quota lookup failed");
                return QuotaDecision::Unavailable;
            }
        };

        if !state.has_access(now) {
            return QuotaDecision::SubscriptionDenied;
        }

        if state.is_trial() {
            return match self.store.consume_trial_unit(org_id, now).await {
                Ok(Some(state)) => {
                    debug!(
                        org_id = %org_id,
                        daily_used = state.daily_used,
                        daily_limit = state.daily_limit,
                        "trial unit consumed"
                    );
                    QuotaDecision::Allowed { over_quota: false }
                }
                Ok(None) => {
                    info!(org_id = %org_id, "trial quota exhausted for today");
                    QuotaDecision::QuotaExceeded
                }
                Err(e) => {
                    error!(org_id = %org_id, error = %e, "trial quota update failed");
                    QuotaDecision::Unavailable
                }
            };
        }

        match self
            .store
            .consume_paid_unit(org_id, self.policy.overage_hard_cap)
            .await
        {
            Ok(Some(state)) => {
                let over_quota = state.over_quota();
                if over_quota {
                    debug!(
                        org_id = %org_id,
                        monthly_used = state.monthly_used,
                        monthly_limit = state.monthly_limit,
                        "paid unit beyond monthly allotment"
                    );
                    self.report_overage_usage(org_id, 1).await;
                }
                QuotaDecision::Allowed { over_quota }
            }
            Ok(None) => {
                warn!(
                    org_id = %org_id,
                    hard_cap = ?self.policy.overage_hard_cap,
                    "overage cap reached"
                );
                QuotaDecision::OverageCapReached
            }
            Err(e) => {
                error!(org_id = %org_id, error = %e, "paid quota update failed");
                QuotaDecision::Unavailable
            }
        }
    }

    /// Bill `quantity` overage units. Failures are logged, never raised.
    ///
    /// Bounded by [`OVERAGE_REPORT_TIMEOUT`] so a slow billing API cannot hold
    /// up the answer.
    pub async fn report_overage_usage(&self, org_id: Uuid, quantity: u32) {
        let report = self.billing.report_usage_event(org_id, quantity);
        match tokio::time::timeout(OVERAGE_REPORT_TIMEOUT, report).await {
            Ok(Ok(())) => info!(org_id = %org_id, quantity, "overage usage reported"),
            Ok(Err(e)) => {
                error!(org_id = %org_id, quantity, error = %e, "failed to report overage usage")
            }
            Err(_) => error!(
                org_id = %org_id,
                quantity,
                timeout_ms = OVERAGE_REPORT_TIMEOUT.as_millis() as u64,
                "overage usage report timed out"
            ),
        }
    }

    /// Re-read one organization's subscription from billing.
    ///
    /// Returns `false` when billing or storage failed, or the organization
    /// has no quota row.
    pub async fn refresh_subscription(&self, org_id: Uuid) -> bool {
        let subscription = match self.billing.fetch_subscription_state(org_id).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(org_id = %org_id, error = %e, "failed to fetch subscription state");
                return false;
            }
        };

        match self
            .store
            .apply_subscription(org_id, &subscription, self.policy.paid_monthly_limit)
            .await
        {
            Ok(Some(state)) => {
                debug!(
                    org_id = %org_id,
                    active = state.subscription_active,
                    period_end = ?state.period_end,
                    "subscription refreshed"
                );
                true
            }
            Ok(None) => {
                warn!(org_id = %org_id, "subscription refresh for unknown organization");
                false
            }
            Err(e) => {
                warn!(org_id = %org_id, error = %e, "failed to store subscription state");
                false
            }
        }
    }

    /// Refresh every organization. Individual failures are skipped.
    pub async fn refresh_all_subscriptions(&self) -> Result<usize> {
        let org_ids = self.store.list_org_ids().await?;
        let mut refreshed = 0;
        for org_id in &org_ids {
            if self.refresh_subscription(*org_id).await {
                refreshed += 1;
            }
        }
        info!(total = org_ids.len(), refreshed, "subscriptions refreshed");
        Ok(refreshed)
    }

    /// Start a trial for a new organization. Existing rows are kept as-is.
    pub async fn enroll_trial(&self, org_id: Uuid) -> Result<QuotaState> {
        let trial = QuotaState::trial(
            org_id,
            Utc::now() + Duration::days(self.policy.trial_days),
            self.policy.trial_daily_limit,
        );
        let state = self.store.insert_trial(trial).await?;
        info!(org_id = %org_id, trial_ends_at = ?state.trial_ends_at, "organization enrolled");
        Ok(state)
    }
}
