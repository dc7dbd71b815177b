use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use uuid::Uuid;

use super::{BaseBillingProvider, SubscriptionState};

const STRIPE_API_BASE: &str = "https://api.stripe.com";

/// Stripe REST client for subscription lookups and metered usage.
///
/// Subscriptions are linked to organizations through `metadata.org_id`.
pub struct StripeBillingClient {
    secret_key: String,
    meter_event: String,
    base_url: String,
    client: reqwest::Client,
    /// org_id -> Stripe customer id, filled by subscription lookups
    customers: DashMap<Uuid, String>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionSearch {
    data: Vec<StripeSubscription>,
}

#[derive(Debug, Deserialize)]
struct StripeSubscription {
    status: String,
    customer: String,
    #[serde(default)]
    current_period_end: Option<i64>,
    #[serde(default)]
    items: Option<SubscriptionItems>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionItems {
    data: Vec<SubscriptionItem>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionItem {
    price: Price,
}

#[derive(Debug, Deserialize)]
struct Price {
    id: String,
}

impl StripeSubscription {
    fn is_active(&self) -> bool {
        matches!(self.status.as_str(), "active" | "trialing")
    }

    fn into_state(self) -> SubscriptionState {
        let active = self.is_active();
        SubscriptionState {
            active,
            period_end: self
                .current_period_end
                .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)),
            price_id: self
                .items
                .and_then(|items| items.data.into_iter().next())
                .map(|item| item.price.id),
        }
    }
}

/// Prefer an active subscription; otherwise the most recent one Stripe returned.
fn select_subscription(mut subscriptions: Vec<StripeSubscription>) -> Option<StripeSubscription> {
    match subscriptions.iter().position(StripeSubscription::is_active) {
        Some(index) => Some(subscriptions.swap_remove(index)),
        None => subscriptions.into_iter().next(),
    }
}

impl StripeBillingClient {
    pub fn new(secret_key: String, meter_event: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            secret_key,
            meter_event,
            base_url: STRIPE_API_BASE.to_string(),
            client,
            customers: DashMap::new(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn customer_id(&self, org_id: Uuid) -> Result<String> {
        if let Some(customer) = self.customers.get(&org_id) {
            return Ok(customer.clone());
        }
        self.fetch_subscription_state(org_id).await?;
        self.customers
            .get(&org_id)
            .map(|customer| customer.clone())
            .with_context(|| format!("No Stripe customer for organization {}", org_id))
    }
}

#[async_trait]
impl BaseBillingProvider for StripeBillingClient {
    async fn fetch_subscription_state(&self, org_id: Uuid) -> Result<SubscriptionState> {
        let query = format!("metadata['org_id']:'{}'", org_id);

        let response = self
            .client
            .get(format!("{}/v1/subscriptions/search", self.base_url))
            .basic_auth(&self.secret_key, None::<&str>)
            .query(&[("query", query.as_str()), ("limit", "10")])
            .send()
            .await
            .context("Failed to send Stripe subscription search")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Stripe API error {}: {}", status, body);
        }

        let search: SubscriptionSearch = response
            .json()
            .await
            .context("Failed to parse Stripe subscription search")?;

        let Some(subscription) = select_subscription(search.data) else {
            return Ok(SubscriptionState::inactive());
        };

        self.customers
            .insert(org_id, subscription.customer.clone());
        Ok(subscription.into_state())
    }

    async fn report_usage_event(&self, org_id: Uuid, quantity: u32) -> Result<()> {
        let customer = self.customer_id(org_id).await?;
        let identifier = Uuid::new_v4().to_string();
        let timestamp = Utc::now().timestamp().to_string();
        let value = quantity.to_string();

        let response = self
            .client
            .post(format!("{}/v1/billing/meter_events", self.base_url))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(&[
                ("event_name", self.meter_event.as_str()),
                ("payload[stripe_customer_id]", customer.as_str()),
                ("payload[value]", value.as_str()),
                ("identifier", identifier.as_str()),
                ("timestamp", timestamp.as_str()),
            ])
            .send()
            .await
            .context("Failed to send Stripe meter event")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Stripe API error {}: {}", status, body);
        }

        tracing::debug!(org_id = %org_id, quantity, "usage event reported");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEARCH_RESPONSE: &str = r#"{
        "object": "search_result",
        "data": [
            {
                "id": "sub_old",
                "status": "canceled",
                "customer": "cus_1",
                "current_period_end": 1735689600,
                "items": {"data": [{"price": {"id": "price_old"}}]}
            },
            {
                "id": "sub_new",
                "status": "active",
                "customer": "cus_1",
                "current_period_end": 1738368000,
                "items": {"data": [{"price": {"id": "price_pro"}}]}
            }
        ]
    }"#;

    #[test]
    fn active_subscription_wins() {
        let search: SubscriptionSearch = serde_json::from_str(SEARCH_RESPONSE).unwrap();
        let state = select_subscription(search.data).unwrap().into_state();

        assert!(state.active);
        assert_eq!(state.price_id.as_deref(), Some("price_pro"));
        assert_eq!(
            state.period_end,
            DateTime::<Utc>::from_timestamp(1_738_368_000, 0)
        );
    }

    #[test]
    fn canceled_only_is_inactive() {
        let search: SubscriptionSearch = serde_json::from_str(
            r#"{"data":[{"status":"canceled","customer":"cus_2"}]}"#,
        )
        .unwrap();
        let state = select_subscription(search.data).unwrap().into_state();

        assert!(!state.active);
        assert!(state.period_end.is_none());
        assert!(state.price_id.is_none());
    }

    #[test]
    fn no_subscriptions() {
        assert!(select_subscription(Vec::new()).is_none());
    }
}
