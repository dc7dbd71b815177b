// TestDependencies - mock implementations for testing
//
// Provides mock services that can be injected into ServerDeps and the
// orchestrator for tests. No network or database is needed.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use completion_client::testing::MockProvider;
use completion_client::{RetryPolicy, StructuredCompletionClient};
use uuid::Uuid;

use super::pool::{ConnectionManager, ResourcePool};
use super::traits::{
    BaseBillingProvider, BaseRetrievalService, BaseTextSanitizer, ScoredDocument,
    SubscriptionState,
};
use super::ServerDeps;
use crate::domains::admission::{
    AdmissionController, AdmissionPolicy, MemoryQuotaStore, QuotaState, QuotaStore,
};
use crate::domains::chat::{ChatTurn, QueryOrchestrator, Topic};

// =============================================================================
// Mock Connection Manager
// =============================================================================

#[derive(Debug)]
pub struct MockConnection {
    pub id: u64,
}

#[derive(Default)]
struct MockConnectionState {
    next_id: AtomicU64,
    broken: Mutex<HashSet<u64>>,
    refuse: AtomicBool,
}

/// Hands out numbered connections. Broken ids fail their probe.
#[derive(Clone, Default)]
pub struct MockConnectionManager {
    state: Arc<MockConnectionState>,
}

impl MockConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the connection with `id` fail every probe from now on.
    pub fn break_connection(&self, id: u64) {
        self.state.broken.lock().unwrap().insert(id);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionManager for MockConnectionManager {
    type Connection = MockConnection;

    async fn connect(&self) -> Result<MockConnection> {
        if self.state.refuse.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        Ok(MockConnection {
            id: self.state.next_id.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn probe(&self, conn: &mut MockConnection) -> Result<()> {
        if self.state.broken.lock().unwrap().contains(&conn.id) {
            anyhow::bail!("connection {} is dead", conn.id);
        }
        Ok(())
    }
}

// =============================================================================
// Mock Retrieval Service
// =============================================================================

/// Arguments captured from a search call
#[derive(Debug, Clone, PartialEq)]
pub struct SearchCallArgs {
    pub query: String,
    pub topics: BTreeSet<Topic>,
    pub years: BTreeSet<i32>,
    pub history: Vec<ChatTurn>,
}

pub struct MockRetrievalService {
    responses: Arc<Mutex<Vec<Vec<ScoredDocument>>>>,
    calls: Arc<Mutex<Vec<SearchCallArgs>>>,
    fail: bool,
}

impl MockRetrievalService {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            fail: false,
        }
    }

    pub fn with_documents(self, documents: Vec<ScoredDocument>) -> Self {
        self.responses.lock().unwrap().push(documents);
        self
    }

    /// Every search fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> Vec<SearchCallArgs> {
        self.calls.lock().unwrap().clone()
    }
}

impl Default for MockRetrievalService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BaseRetrievalService for MockRetrievalService {
    async fn search(
        &self,
        query: &str,
        topics: &BTreeSet<Topic>,
        years: &BTreeSet<i32>,
        history: &[ChatTurn],
    ) -> Result<Vec<ScoredDocument>> {
        self.calls.lock().unwrap().push(SearchCallArgs {
            query: query.to_string(),
            topics: topics.clone(),
            years: years.clone(),
            history: history.to_vec(),
        });

        if self.fail {
            anyhow::bail!("retrieval service unavailable");
        }

        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(responses.remove(0))
        }
    }
}

/// A retrieval hit with plausible sub-scores.
pub fn scored_document(title: &str, content: &str) -> ScoredDocument {
    ScoredDocument {
        id: Uuid::new_v4().to_string(),
        title: title.to_string(),
        content: content.to_string(),
        source_url: None,
        keyword_score: 0.5,
        semantic_score: 0.8,
        rerank_score: 0.7,
        score: 0.3 * 0.5 + 0.5 * 0.8 + 0.2 * 0.7,
    }
}

// =============================================================================
// Mock Billing Provider
// =============================================================================

pub struct MockBillingProvider {
    subscriptions: Mutex<HashMap<Uuid, SubscriptionState>>,
    failing_fetches: Mutex<HashSet<Uuid>>,
    fail_usage: AtomicBool,
    hang_usage: AtomicBool,
    fetches: Mutex<Vec<Uuid>>,
    usage_reports: Mutex<Vec<(Uuid, u32)>>,
}

impl MockBillingProvider {
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            failing_fetches: Mutex::new(HashSet::new()),
            fail_usage: AtomicBool::new(false),
            hang_usage: AtomicBool::new(false),
            fetches: Mutex::new(Vec::new()),
            usage_reports: Mutex::new(Vec::new()),
        }
    }

    pub fn set_subscription(&self, org_id: Uuid, state: SubscriptionState) {
        self.subscriptions.lock().unwrap().insert(org_id, state);
    }

    pub fn active_until(&self, org_id: Uuid, period_end: DateTime<Utc>) {
        self.set_subscription(
            org_id,
            SubscriptionState {
                active: true,
                period_end: Some(period_end),
                price_id: Some("price_test".to_string()),
            },
        );
    }

    pub fn fail_subscription_fetch(&self, org_id: Uuid) {
        self.failing_fetches.lock().unwrap().insert(org_id);
    }

    pub fn fail_usage_reports(&self) {
        self.fail_usage.store(true, Ordering::SeqCst);
    }

    /// Usage reports never complete.
    pub fn hang_usage_reports(&self) {
        self.hang_usage.store(true, Ordering::SeqCst);
    }

    pub fn subscription_fetches(&self) -> Vec<Uuid> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn usage_reports(&self) -> Vec<(Uuid, u32)> {
        self.usage_reports.lock().unwrap().clone()
    }
}

impl Default for MockBillingProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BaseBillingProvider for MockBillingProvider {
    async fn fetch_subscription_state(&self, org_id: Uuid) -> Result<SubscriptionState> {
        self.fetches.lock().unwrap().push(org_id);
        if self.failing_fetches.lock().unwrap().contains(&org_id) {
            anyhow::bail!("billing API error for {}", org_id);
        }
        Ok(self
            .subscriptions
            .lock()
            .unwrap()
            .get(&org_id)
            .cloned()
            .unwrap_or_else(SubscriptionState::inactive))
    }

    async fn report_usage_event(&self, org_id: Uuid, quantity: u32) -> Result<()> {
        if self.hang_usage.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if self.fail_usage.load(Ordering::SeqCst) {
            anyhow::bail!("billing API error");
        }
        self.usage_reports.lock().unwrap().push((org_id, quantity));
        Ok(())
    }
}

// =============================================================================
// Mock Sanitizer
// =============================================================================

/// Records every fragment and tags it so tests can tell it was applied.
pub struct MockSanitizer {
    calls: Mutex<Vec<String>>,
}

impl MockSanitizer {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Default for MockSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl BaseTextSanitizer for MockSanitizer {
    fn sanitize(&self, text: &str) -> String {
        self.calls.lock().unwrap().push(text.to_string());
        text.replace("**", "")
    }
}

// =============================================================================
// Quota stores
// =============================================================================

/// Every operation fails as if the database were down.
pub struct FailingQuotaStore;

#[async_trait]
impl QuotaStore for FailingQuotaStore {
    async fn find(&self, _org_id: Uuid) -> Result<Option<QuotaState>> {
        anyhow::bail!("database unavailable")
    }

    async fn insert_trial(&self, _state: QuotaState) -> Result<QuotaState> {
        anyhow::bail!("database unavailable")
    }

    async fn consume_trial_unit(
        &self,
        _org_id: Uuid,
        _now: DateTime<Utc>,
    ) -> Result<Option<QuotaState>> {
        anyhow::bail!("database unavailable")
    }

    async fn consume_paid_unit(
        &self,
        _org_id: Uuid,
        _hard_cap: Option<i32>,
    ) -> Result<Option<QuotaState>> {
        anyhow::bail!("database unavailable")
    }

    async fn apply_subscription(
        &self,
        _org_id: Uuid,
        _subscription: &SubscriptionState,
        _monthly_limit: i32,
    ) -> Result<Option<QuotaState>> {
        anyhow::bail!("database unavailable")
    }

    async fn list_org_ids(&self) -> Result<Vec<Uuid>> {
        anyhow::bail!("database unavailable")
    }
}

/// In-memory store that leases a pooled connection for every operation,
/// the way the Postgres store does.
pub struct LeasingQuotaStore<M: ConnectionManager> {
    pool: ResourcePool<M>,
    inner: Arc<MemoryQuotaStore>,
}

impl<M: ConnectionManager> LeasingQuotaStore<M> {
    pub fn new(pool: ResourcePool<M>, inner: Arc<MemoryQuotaStore>) -> Self {
        Self { pool, inner }
    }
}

#[async_trait]
impl<M: ConnectionManager> QuotaStore for LeasingQuotaStore<M> {
    async fn find(&self, org_id: Uuid) -> Result<Option<QuotaState>> {
        let _conn = self.pool.acquire().await?;
        self.inner.find(org_id).await
    }

    async fn insert_trial(&self, state: QuotaState) -> Result<QuotaState> {
        let _conn = self.pool.acquire().await?;
        self.inner.insert_trial(state).await
    }

    async fn consume_trial_unit(
        &self,
        org_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<QuotaState>> {
        let _conn = self.pool.acquire().await?;
        self.inner.consume_trial_unit(org_id, now).await
    }

    async fn consume_paid_unit(
        &self,
        org_id: Uuid,
        hard_cap: Option<i32>,
    ) -> Result<Option<QuotaState>> {
        let _conn = self.pool.acquire().await?;
        self.inner.consume_paid_unit(org_id, hard_cap).await
    }

    async fn apply_subscription(
        &self,
        org_id: Uuid,
        subscription: &SubscriptionState,
        monthly_limit: i32,
    ) -> Result<Option<QuotaState>> {
        let _conn = self.pool.acquire().await?;
        self.inner
            .apply_subscription(org_id, subscription, monthly_limit)
            .await
    }

    async fn list_org_ids(&self) -> Result<Vec<Uuid>> {
        let _conn = self.pool.acquire().await?;
        self.inner.list_org_ids().await
    }
}

// =============================================================================
// TestDependencies - Builder for test dependencies
// =============================================================================

#[derive(Clone)]
pub struct TestDependencies {
    pub provider: Arc<MockProvider>,
    pub retrieval: Arc<MockRetrievalService>,
    pub billing: Arc<MockBillingProvider>,
    pub sanitizer: Arc<MockSanitizer>,
    pub quotas: Arc<MemoryQuotaStore>,
    pub store: Arc<dyn QuotaStore>,
    pub policy: AdmissionPolicy,
    pub completion_timeout: Duration,
}

impl TestDependencies {
    pub fn new() -> Self {
        let quotas = Arc::new(MemoryQuotaStore::new());
        Self {
            provider: Arc::new(MockProvider::new()),
            retrieval: Arc::new(MockRetrievalService::new()),
            billing: Arc::new(MockBillingProvider::new()),
            sanitizer: Arc::new(MockSanitizer::new()),
            store: quotas.clone(),
            quotas,
            policy: AdmissionPolicy::default(),
            completion_timeout: Duration::from_secs(120),
        }
    }

    /// Set a mock retrieval service
    pub fn mock_retrieval(mut self, retrieval: MockRetrievalService) -> Self {
        self.retrieval = Arc::new(retrieval);
        self
    }

    /// Seed an organization's quota row
    pub fn with_quota(self, state: QuotaState) -> Self {
        self.quotas.put(state);
        self
    }

    /// Route quota access through a different store (e.g. a leasing or failing one)
    pub fn quota_store(mut self, store: Arc<dyn QuotaStore>) -> Self {
        self.store = store;
        self
    }

    pub fn policy(mut self, policy: AdmissionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    pub fn admission(&self) -> Arc<AdmissionController> {
        Arc::new(AdmissionController::new(
            self.store.clone(),
            self.billing.clone(),
            self.policy.clone(),
        ))
    }

    pub fn completions(&self) -> StructuredCompletionClient {
        StructuredCompletionClient::new(self.provider.clone(), "gpt-test")
            .with_timeout(self.completion_timeout)
            .with_retry_policy(RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(5),
            })
    }

    pub fn server_deps(&self) -> ServerDeps {
        ServerDeps::new(
            self.admission(),
            self.completions(),
            self.retrieval.clone(),
            self.sanitizer.clone(),
            self.billing.clone(),
        )
    }

    pub fn orchestrator(&self) -> QueryOrchestrator {
        self.server_deps().orchestrator()
    }
}

impl Default for TestDependencies {
    fn default() -> Self {
        Self::new()
    }
}
