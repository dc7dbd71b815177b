//! The seam between the structured client and a concrete model provider.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::Result;
use crate::streaming::ChatCompletionChunk;
use crate::types::{StructuredRequest, Usage};

/// Stream of raw deltas from a provider.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<ChatCompletionChunk>> + Send>>;

/// Terminal status of a provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionStatus {
    Completed,
    /// The model stopped to wait for a tool result.
    RequiresAction,
    Failed(String),
}

impl CompletionStatus {
    /// Map an OpenAI `finish_reason`.
    pub fn from_finish_reason(reason: Option<&str>) -> Self {
        match reason {
            None | Some("stop") => CompletionStatus::Completed,
            Some("tool_calls") | Some("function_call") => CompletionStatus::RequiresAction,
            Some(other) => CompletionStatus::Failed(other.to_string()),
        }
    }
}

/// Result of a non-streaming provider call.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub status: CompletionStatus,
    pub content: Option<String>,
    pub usage: Option<Usage>,
}

impl ProviderResponse {
    /// A successful response with `content`.
    pub fn completed(content: impl Into<String>) -> Self {
        Self {
            status: CompletionStatus::Completed,
            content: Some(content.into()),
            usage: None,
        }
    }
}

/// Generative-model transport used by [`StructuredCompletionClient`](crate::StructuredCompletionClient).
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Run a request to completion.
    async fn create(&self, request: &StructuredRequest) -> Result<ProviderResponse>;

    /// Start a streaming request.
    async fn create_stream(&self, request: &StructuredRequest) -> Result<DeltaStream>;
}
