//! Schema-validated completions over the OpenAI chat API.
//!
//! Two layers:
//!
//! - [`OpenAIClient`] is the raw transport (`/chat/completions`, JSON or SSE).
//! - [`StructuredCompletionClient`] asks for a caller-declared type, validates
//!   every answer against it, retries within a bounded budget, and can stream
//!   partially-filled values of that type.
//!
//! # Example
//!
//! ```rust,ignore
//! use completion_client::{CompletionOptions, Message, OpenAIClient, StructuredCompletionClient};
//! use schemars::JsonSchema;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize, JsonSchema)]
//! struct Verdict {
//!     rate: String,
//! }
//!
//! let client = StructuredCompletionClient::new(Arc::new(OpenAIClient::from_env()?), "gpt-4o");
//! let verdict: Verdict = client
//!     .complete(vec![Message::user("btw tarief horeca")], CompletionOptions::default())
//!     .await?;
//! ```

pub mod error;
pub mod partial;
pub mod provider;
pub mod schema;
pub mod streaming;
pub mod structured;
pub mod testing;
pub mod types;

pub use error::{CompletionError, OpenAIError, Result};
pub use partial::PartialMerger;
pub use provider::{CompletionProvider, CompletionStatus, DeltaStream, ProviderResponse};
pub use schema::StructuredOutput;
pub use streaming::{ChatCompletionChunk, ChatCompletionStream};
pub use structured::{
    CompletionOptions, CompletionStream, RetryBudget, RetryPolicy, StructuredCompletionClient,
};
pub use types::*;

use async_trait::async_trait;
use reqwest::{header, Client};
use tracing::{debug, warn};

/// OpenAI chat completions transport.
#[derive(Clone)]
pub struct OpenAIClient {
    http_client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAIClient {
    /// Create a new OpenAI client with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http_client: Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    /// Create from environment variable `OPENAI_API_KEY`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| OpenAIError::Config("OPENAI_API_KEY not set".into()))?;
        Ok(Self::new(api_key))
    }

    /// Set a custom base URL (for Azure, proxies, etc.).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(&self, request: &StructuredRequest) -> Result<reqwest::Response> {
        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(header::CONTENT_TYPE, "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "OpenAI request failed");
                OpenAIError::Network(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(status = %status, error = %message, "OpenAI API error");
            return Err(OpenAIError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl CompletionProvider for OpenAIClient {
    async fn create(&self, request: &StructuredRequest) -> Result<ProviderResponse> {
        let start = std::time::Instant::now();
        let response = self.post(request).await?;

        let raw: types::ChatResponseRaw = response
            .json()
            .await
            .map_err(|e| OpenAIError::Parse(e.to_string()))?;

        let choice = raw
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| OpenAIError::Parse("No choices in OpenAI response".into()))?;

        debug!(
            model = %request.model,
            schema = %request.response_format.json_schema.name,
            finish_reason = ?choice.finish_reason,
            duration_ms = start.elapsed().as_millis(),
            "OpenAI structured completion"
        );

        Ok(ProviderResponse {
            status: CompletionStatus::from_finish_reason(choice.finish_reason.as_deref()),
            content: choice.message.content,
            usage: raw.usage,
        })
    }

    async fn create_stream(&self, request: &StructuredRequest) -> Result<DeltaStream> {
        let mut request = request.clone();
        request.stream = true;
        let response = self.post(&request).await?;
        Ok(Box::pin(ChatCompletionStream::new(response.bytes_stream())))
    }
}
