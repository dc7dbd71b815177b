use std::collections::BTreeSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{BaseRetrievalService, ScoredDocument};
use crate::domains::chat::{ChatTurn, Topic};

/// Client for the document retrieval service (hybrid keyword/vector search
/// with reranking)
pub struct HttpRetrievalClient {
    base_url: String,
    client: reqwest::Client,
}

/// Retrieval API request
#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    topics: &'a BTreeSet<Topic>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    years: &'a BTreeSet<i32>,
    #[serde(skip_serializing_if = "<[ChatTurn]>::is_empty")]
    history: &'a [ChatTurn],
}

/// Retrieval API response
#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    documents: Vec<ScoredDocument>,
}

impl HttpRetrievalClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl BaseRetrievalService for HttpRetrievalClient {
    async fn search(
        &self,
        query: &str,
        topics: &BTreeSet<Topic>,
        years: &BTreeSet<i32>,
        history: &[ChatTurn],
    ) -> Result<Vec<ScoredDocument>> {
        let request = SearchRequest {
            query,
            topics,
            years,
            history,
        };

        let response = self
            .client
            .post(format!("{}/search", self.base_url))
            .json(&request)
            .send()
            .await
            .context("Failed to send retrieval request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Retrieval API error {}: {}", status, body);
        }

        let mut search: SearchResponse = response
            .json()
            .await
            .context("Failed to parse retrieval response")?;

        search
            .documents
            .sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(search.documents)
    }
}
