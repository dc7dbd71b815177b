//! Quota persistence.
//!
//! Every consumption is one atomic step per organization: a single
//! conditional `UPDATE ... RETURNING` in Postgres, a per-key entry lock in
//! memory. Nothing here reads a counter and writes it back separately.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use super::models::QuotaState;
use crate::kernel::pool::{PgConnectionManager, PooledConnection, ResourcePool};
use crate::kernel::traits::SubscriptionState;

#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn find(&self, org_id: Uuid) -> Result<Option<QuotaState>>;

    /// Insert a trial row. An existing row is left untouched and returned.
    async fn insert_trial(&self, state: QuotaState) -> Result<QuotaState>;

    /// Take one trial unit, rolling the daily window over to `now`'s date.
    ///
    /// Returns `None` when the organization is not in an active trial or has
    /// no units left today.
    async fn consume_trial_unit(&self, org_id: Uuid, now: DateTime<Utc>)
        -> Result<Option<QuotaState>>;

    /// Take one paid unit. Never refused unless `hard_cap` is set and
    /// `monthly_used` already reached `monthly_limit + hard_cap`.
    async fn consume_paid_unit(&self, org_id: Uuid, hard_cap: Option<i32>)
        -> Result<Option<QuotaState>>;

    /// Write billing state. A changed `period_end` starts a new month.
    async fn apply_subscription(
        &self,
        org_id: Uuid,
        subscription: &SubscriptionState,
        monthly_limit: i32,
    ) -> Result<Option<QuotaState>>;

    async fn list_org_ids(&self) -> Result<Vec<Uuid>>;
}

// =============================================================================
// Postgres
// =============================================================================

pub struct PgQuotaStore {
    pool: ResourcePool<PgConnectionManager>,
}

impl PgQuotaStore {
    pub fn new(pool: ResourcePool<PgConnectionManager>) -> Self {
        Self { pool }
    }
}

/// Connection-level failures leave the connection in an unknown state.
fn is_connection_error(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed
    )
}

fn checked<T>(
    conn: &mut PooledConnection<PgConnectionManager>,
    result: std::result::Result<T, sqlx::Error>,
) -> Result<T> {
    if let Err(e) = &result {
        if is_connection_error(e) {
            conn.mark_unhealthy();
        }
    }
    result.map_err(Into::into)
}

#[async_trait]
impl QuotaStore for PgQuotaStore {
    async fn find(&self, org_id: Uuid) -> Result<Option<QuotaState>> {
        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query_as::<_, QuotaState>(
            "SELECT * FROM organization_quotas WHERE org_id = $1",
        )
        .bind(org_id)
        .fetch_optional(&mut *conn)
        .await;
        checked(&mut conn, result)
    }

    async fn insert_trial(&self, state: QuotaState) -> Result<QuotaState> {
        let mut conn = self.pool.acquire().await?;
        let inserted = sqlx::query_as::<_, QuotaState>(
            "INSERT INTO organization_quotas
                (org_id, subscription_active, trial_ends_at, daily_used, daily_limit, daily_window)
             VALUES ($1, false, $2, 0, $3, $4)
             ON CONFLICT (org_id) DO NOTHING
             RETURNING *",
        )
        .bind(state.org_id)
        .bind(state.trial_ends_at)
        .bind(state.daily_limit)
        .bind(state.daily_window)
        .fetch_optional(&mut *conn)
        .await;

        if let Some(inserted) = checked(&mut conn, inserted)? {
            return Ok(inserted);
        }

        let existing = sqlx::query_as::<_, QuotaState>(
            "SELECT * FROM organization_quotas WHERE org_id = $1",
        )
        .bind(state.org_id)
        .fetch_one(&mut *conn)
        .await;
        checked(&mut conn, existing)
    }

    async fn consume_trial_unit(
        &self,
        org_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<QuotaState>> {
        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query_as::<_, QuotaState>(
            "UPDATE organization_quotas
             SET daily_used = CASE WHEN daily_window < $2 THEN 1 ELSE daily_used + 1 END,
                 daily_window = GREATEST(daily_window, $2),
                 updated_at = NOW()
             WHERE org_id = $1
               AND subscription_active = false
               AND trial_ends_at > $3
               AND (CASE WHEN daily_window < $2 THEN 0 ELSE daily_used END) < daily_limit
             RETURNING *",
        )
        .bind(org_id)
        .bind(now.date_naive())
        .bind(now)
        .fetch_optional(&mut *conn)
        .await;
        checked(&mut conn, result)
    }

    async fn consume_paid_unit(
        &self,
        org_id: Uuid,
        hard_cap: Option<i32>,
    ) -> Result<Option<QuotaState>> {
        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query_as::<_, QuotaState>(
            "UPDATE organization_quotas
             SET monthly_used = monthly_used + 1,
                 updated_at = NOW()
             WHERE org_id = $1
               AND subscription_active = true
               AND ($2::INTEGER IS NULL OR monthly_used < monthly_limit + $2)
             RETURNING *",
        )
        .bind(org_id)
        .bind(hard_cap)
        .fetch_optional(&mut *conn)
        .await;
        checked(&mut conn, result)
    }

    async fn apply_subscription(
        &self,
        org_id: Uuid,
        subscription: &SubscriptionState,
        monthly_limit: i32,
    ) -> Result<Option<QuotaState>> {
        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query_as::<_, QuotaState>(
            "UPDATE organization_quotas
             SET monthly_used = CASE WHEN period_end IS DISTINCT FROM $3 THEN 0 ELSE monthly_used END,
                 subscription_active = $2,
                 period_end = $3,
                 price_id = $4,
                 monthly_limit = $5,
                 updated_at = NOW()
             WHERE org_id = $1
             RETURNING *",
        )
        .bind(org_id)
        .bind(subscription.active)
        .bind(subscription.period_end)
        .bind(subscription.price_id.as_deref())
        .bind(monthly_limit)
        .fetch_optional(&mut *conn)
        .await;
        checked(&mut conn, result)
    }

    async fn list_org_ids(&self) -> Result<Vec<Uuid>> {
        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query_scalar::<_, Uuid>(
            "SELECT org_id FROM organization_quotas ORDER BY org_id",
        )
        .fetch_all(&mut *conn)
        .await;
        checked(&mut conn, result)
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Quota store for tests and single-process development.
#[derive(Default)]
pub struct MemoryQuotaStore {
    rows: DashMap<Uuid, QuotaState>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(self, state: QuotaState) -> Self {
        self.rows.insert(state.org_id, state);
        self
    }

    pub fn put(&self, state: QuotaState) {
        self.rows.insert(state.org_id, state);
    }

    pub fn get(&self, org_id: Uuid) -> Option<QuotaState> {
        self.rows.get(&org_id).map(|row| row.clone())
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn find(&self, org_id: Uuid) -> Result<Option<QuotaState>> {
        Ok(self.get(org_id))
    }

    async fn insert_trial(&self, state: QuotaState) -> Result<QuotaState> {
        Ok(self.rows.entry(state.org_id).or_insert(state).clone())
    }

    async fn consume_trial_unit(
        &self,
        org_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<QuotaState>> {
        let Some(mut row) = self.rows.get_mut(&org_id) else {
            return Ok(None);
        };
        let today = now.date_naive();
        let in_trial = !row.subscription_active && row.trial_ends_at.is_some_and(|ends| ends > now);
        if !in_trial || row.daily_remaining(today) == 0 {
            return Ok(None);
        }

        if row.daily_window < today {
            row.daily_window = today;
            row.daily_used = 0;
        }
        row.daily_used += 1;
        Ok(Some(row.clone()))
    }

    async fn consume_paid_unit(
        &self,
        org_id: Uuid,
        hard_cap: Option<i32>,
    ) -> Result<Option<QuotaState>> {
        let Some(mut row) = self.rows.get_mut(&org_id) else {
            return Ok(None);
        };
        if !row.subscription_active {
            return Ok(None);
        }
        if let Some(cap) = hard_cap {
            if row.monthly_used >= row.monthly_limit + cap {
                return Ok(None);
            }
        }
        row.monthly_used += 1;
        Ok(Some(row.clone()))
    }

    async fn apply_subscription(
        &self,
        org_id: Uuid,
        subscription: &SubscriptionState,
        monthly_limit: i32,
    ) -> Result<Option<QuotaState>> {
        let Some(mut row) = self.rows.get_mut(&org_id) else {
            return Ok(None);
        };
        if row.period_end != subscription.period_end {
            row.monthly_used = 0;
        }
        row.subscription_active = subscription.active;
        row.period_end = subscription.period_end;
        row.price_id = subscription.price_id.clone();
        row.monthly_limit = monthly_limit;
        Ok(Some(row.clone()))
    }

    async fn list_org_ids(&self) -> Result<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self.rows.iter().map(|row| *row.key()).collect();
        ids.sort();
        Ok(ids)
    }
}
