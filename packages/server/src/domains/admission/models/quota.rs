use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Usage limits and subscription state of one organization.
///
/// Row of `organization_quotas`. Only the quota stores mutate it, and every
/// consumption is a single atomic step per organization.
#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Serialize)]
pub struct QuotaState {
    pub org_id: Uuid,

    pub subscription_active: bool,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub price_id: Option<String>,

    pub daily_used: i32,
    pub daily_limit: i32,
    /// Calendar date (UTC) `daily_used` belongs to.
    pub daily_window: NaiveDate,

    pub monthly_used: i32,
    pub monthly_limit: i32,
}

impl QuotaState {
    /// A fresh trial row.
    pub fn trial(org_id: Uuid, trial_ends_at: DateTime<Utc>, daily_limit: i32) -> Self {
        Self {
            org_id,
            subscription_active: false,
            trial_ends_at: Some(trial_ends_at),
            period_end: None,
            price_id: None,
            daily_used: 0,
            daily_limit,
            daily_window: Utc::now().date_naive(),
            monthly_used: 0,
            monthly_limit: 0,
        }
    }

    /// No active subscription yet.
    pub fn is_trial(&self) -> bool {
        !self.subscription_active
    }

    /// Paid and past the monthly allotment.
    pub fn over_quota(&self) -> bool {
        self.subscription_active && self.monthly_used > self.monthly_limit
    }

    pub fn has_access(&self, now: DateTime<Utc>) -> bool {
        self.subscription_active || self.trial_ends_at.is_some_and(|ends| now < ends)
    }

    /// Trial units left on `today`, accounting for a pending daily reset.
    pub fn daily_remaining(&self, today: NaiveDate) -> i32 {
        let used = if self.daily_window < today {
            0
        } else {
            self.daily_used
        };
        (self.daily_limit - used).max(0)
    }
}
