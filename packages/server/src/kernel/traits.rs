// Trait definitions for dependency injection
//
// These are INFRASTRUCTURE traits only - no business logic.
// Admission policy and the answer pipeline are domain code that uses these traits.
//
// Naming convention: Base* for trait names (e.g., BaseRetrievalService, BaseBillingProvider)

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domains::chat::types::{ChatTurn, Topic};
use crate::kernel::pool::PoolStatus;

// =============================================================================
// Retrieval Trait (external document search)
// =============================================================================

/// A document returned by the retrieval service.
///
/// The combined `score` is weighted by the service itself; the sub-scores are
/// carried for logging only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredDocument {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub keyword_score: f32,
    #[serde(default)]
    pub semantic_score: f32,
    #[serde(default)]
    pub rerank_score: f32,
    pub score: f32,
}

#[async_trait]
pub trait BaseRetrievalService: Send + Sync {
    /// Ordered best-first.
    async fn search(
        &self,
        query: &str,
        topics: &BTreeSet<Topic>,
        years: &BTreeSet<i32>,
        history: &[ChatTurn],
    ) -> Result<Vec<ScoredDocument>>;
}

// =============================================================================
// Text Sanitizer Trait
// =============================================================================

/// Applied to every outgoing text fragment. Must be side-effect free.
pub trait BaseTextSanitizer: Send + Sync {
    fn sanitize(&self, text: &str) -> String;
}

// =============================================================================
// Billing Trait
// =============================================================================

/// Quota-relevant subset of an organization's subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionState {
    pub active: bool,
    pub period_end: Option<DateTime<Utc>>,
    pub price_id: Option<String>,
}

impl SubscriptionState {
    pub fn inactive() -> Self {
        Self {
            active: false,
            period_end: None,
            price_id: None,
        }
    }
}

#[async_trait]
pub trait BaseBillingProvider: Send + Sync {
    async fn fetch_subscription_state(&self, org_id: Uuid) -> Result<SubscriptionState>;

    /// Report `quantity` metered units for the organization.
    async fn report_usage_event(&self, org_id: Uuid, quantity: u32) -> Result<()>;
}

// =============================================================================
// Pool Monitor Trait (health endpoint)
// =============================================================================

#[async_trait]
pub trait BasePoolMonitor: Send + Sync {
    fn status(&self) -> PoolStatus;

    /// Lease and probe one connection.
    async fn check(&self) -> Result<()>;
}
