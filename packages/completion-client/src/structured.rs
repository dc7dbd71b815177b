//! Structured completions with bounded retries and partial-object streaming.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::CompletionError;
use crate::partial::PartialMerger;
use crate::provider::{CompletionProvider, CompletionStatus};
use crate::schema::StructuredOutput;
use crate::types::{Message, StructuredRequest, ToolDefinition};

/// Default bound on a single provider round-trip.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Stream of partially-populated values. Finite, not restartable.
pub type CompletionStream<T> = Pin<Box<dyn Stream<Item = Result<T, CompletionError>> + Send>>;

/// How often and how patiently to retry transient failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// A fresh budget for one call.
    pub fn budget(&self) -> RetryBudget {
        RetryBudget {
            remaining: self.max_retries,
            used: 0,
        }
    }

    /// Exponential backoff for the `attempt`-th retry (1-based), capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Retries left for a single call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryBudget {
    remaining: u32,
    used: u32,
}

impl RetryBudget {
    /// Take one retry. Returns `false` when the budget is exhausted.
    pub fn try_consume(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        self.used += 1;
        true
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Retries taken so far.
    pub fn used(&self) -> u32 {
        self.used
    }
}

/// Per-call options. Anything left `None` is not sent to the provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_completion_tokens: Option<u32>,
    pub tools: Option<Vec<ToolDefinition>>,
    pub tool_choice: Option<serde_json::Value>,
    pub retry: Option<RetryPolicy>,
}

impl CompletionOptions {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn max_completion_tokens(mut self, tokens: u32) -> Self {
        self.max_completion_tokens = Some(tokens);
        self
    }

    pub fn tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn tool_choice(mut self, choice: serde_json::Value) -> Self {
        self.tool_choice = Some(choice);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

/// Issues schema-validated completions against a [`CompletionProvider`].
#[derive(Clone)]
pub struct StructuredCompletionClient {
    provider: Arc<dyn CompletionProvider>,
    default_model: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl StructuredCompletionClient {
    pub fn new(provider: Arc<dyn CompletionProvider>, default_model: impl Into<String>) -> Self {
        Self {
            provider,
            default_model: default_model.into(),
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    /// Bound on each provider round-trip (and on each wait for the next stream delta).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Policy used when a call does not bring its own.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn build_request<T: StructuredOutput>(
        &self,
        messages: Vec<Message>,
        options: &CompletionOptions,
    ) -> StructuredRequest {
        let model = options
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let mut request = StructuredRequest::new(model, messages, T::output_name(), T::strict_schema());
        request.temperature = options.temperature;
        request.max_completion_tokens = options.max_completion_tokens;
        request.tools = options.tools.clone();
        request.tool_choice = options.tool_choice.clone();
        request
    }

    /// Run a completion and parse it into `T`.
    ///
    /// Transient provider failures and schema mismatches are retried within
    /// the budget. A timeout or a request for a tool result ends the call.
    pub async fn complete<T: StructuredOutput>(
        &self,
        messages: Vec<Message>,
        options: CompletionOptions,
    ) -> Result<T, CompletionError> {
        let policy = options.retry.clone().unwrap_or_else(|| self.retry.clone());
        let request = self.build_request::<T>(messages, &options);
        let mut budget = policy.budget();

        loop {
            let failure = match tokio::time::timeout(self.timeout, self.provider.create(&request))
                .await
            {
                Err(_) => return Err(CompletionError::UpstreamTimeout(self.timeout)),
                Ok(Err(e)) if e.is_transient() => e.to_string(),
                Ok(Err(e)) => return Err(CompletionError::UpstreamFailed(e.to_string())),
                Ok(Ok(response)) => match response.status {
                    CompletionStatus::RequiresAction => {
                        return Err(CompletionError::UpstreamRequiresAction)
                    }
                    CompletionStatus::Failed(status) => {
                        return Err(CompletionError::UpstreamFailed(status))
                    }
                    CompletionStatus::Completed => {
                        match parse_structured::<T>(response.content.as_deref()) {
                            Ok(value) => {
                                debug!(
                                    schema = %request.response_format.json_schema.name,
                                    retries = budget.used(),
                                    "structured completion parsed"
                                );
                                return Ok(value);
                            }
                            Err(e) => e.to_string(),
                        }
                    }
                },
            };

            if !budget.try_consume() {
                return Err(CompletionError::UpstreamFailed(format!(
                    "retries exhausted: {}",
                    failure
                )));
            }
            let delay = policy.delay_for(budget.used());
            warn!(
                schema = %request.response_format.json_schema.name,
                attempt = budget.used(),
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "retrying structured completion"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Stream partially-populated values of `T`.
    ///
    /// Every item is a complete `T`: fields that have not arrived yet keep
    /// their `Default` values. Opening the stream is retried within the
    /// budget; once deltas have started there is no restart. The timeout
    /// bounds the whole call, from first poll to the last delta.
    pub fn stream_complete<T>(
        &self,
        messages: Vec<Message>,
        options: CompletionOptions,
    ) -> CompletionStream<T>
    where
        T: StructuredOutput + Serialize + Default + Clone + Send + 'static,
    {
        let policy = options.retry.clone().unwrap_or_else(|| self.retry.clone());
        let request = self.build_request::<T>(messages, &options);
        let provider = self.provider.clone();
        let timeout = self.timeout;

        Box::pin(stream! {
            let deadline = tokio::time::Instant::now() + timeout;
            let mut budget = policy.budget();
            let mut deltas = loop {
                match tokio::time::timeout_at(deadline, provider.create_stream(&request)).await {
                    Err(_) => {
                        yield Err(CompletionError::UpstreamTimeout(timeout));
                        return;
                    }
                    Ok(Ok(deltas)) => break deltas,
                    Ok(Err(e)) if e.is_transient() && budget.try_consume() => {
                        let delay = policy.delay_for(budget.used());
                        warn!(attempt = budget.used(), error = %e, "retrying stream open");
                        if tokio::time::timeout_at(deadline, tokio::time::sleep(delay)).await.is_err() {
                            yield Err(CompletionError::UpstreamTimeout(timeout));
                            return;
                        }
                    }
                    Ok(Err(e)) => {
                        yield Err(CompletionError::UpstreamFailed(e.to_string()));
                        return;
                    }
                }
            };

            let mut merger = PartialMerger::<T>::new();
            loop {
                let chunk = match tokio::time::timeout_at(deadline, deltas.next()).await {
                    Err(_) => {
                        yield Err(CompletionError::UpstreamTimeout(timeout));
                        return;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        yield Err(CompletionError::UpstreamFailed(e.to_string()));
                        return;
                    }
                    Ok(Some(Ok(chunk))) => chunk,
                };

                if !chunk.delta.is_empty() {
                    yield Ok(merger.push(&chunk.delta));
                }

                match CompletionStatus::from_finish_reason(chunk.finish_reason.as_deref()) {
                    CompletionStatus::Completed => {}
                    CompletionStatus::RequiresAction => {
                        yield Err(CompletionError::UpstreamRequiresAction);
                        return;
                    }
                    CompletionStatus::Failed(status) => {
                        yield Err(CompletionError::UpstreamFailed(status));
                        return;
                    }
                }

                if chunk.done {
                    break;
                }
            }

            if let Err(e) = merger.finish() {
                warn!(error = %e, received = merger.raw().len(), "streamed output does not match schema");
                yield Err(CompletionError::UpstreamFailed(format!(
                    "streamed output does not match schema: {}",
                    e
                )));
            }
        })
    }
}

fn parse_structured<T: StructuredOutput>(content: Option<&str>) -> Result<T, CompletionError> {
    let content = content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| CompletionError::SchemaParseFailure("empty content".into()))?;
    serde_json::from_str(content).map_err(|e| CompletionError::SchemaParseFailure(e.to_string()))
}
