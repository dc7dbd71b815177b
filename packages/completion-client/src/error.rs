//! Error types for the completion client.

use std::time::Duration;

use thiserror::Error;

/// Result type for provider transport operations.
pub type Result<T> = std::result::Result<T, OpenAIError>;

/// Transport-level errors from the OpenAI API.
#[derive(Debug, Error)]
pub enum OpenAIError {
    /// Configuration error (missing API key, invalid settings)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network error (connection failed, reset, body read failed)
    #[error("Network error: {0}")]
    Network(String),

    /// API error (non-2xx response)
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Parse error (invalid JSON, unexpected response format)
    #[error("Parse error: {0}")]
    Parse(String),
}

impl OpenAIError {
    /// Whether retrying the same request may succeed.
    ///
    /// Network failures, rate limits and server errors are transient.
    /// Everything else (bad request, auth, config) fails the same way twice.
    pub fn is_transient(&self) -> bool {
        match self {
            OpenAIError::Network(_) => true,
            OpenAIError::Api { status, .. } => *status == 429 || *status >= 500,
            OpenAIError::Config(_) | OpenAIError::Parse(_) => false,
        }
    }
}

/// Errors surfaced by [`StructuredCompletionClient`](crate::StructuredCompletionClient).
#[derive(Debug, Error)]
pub enum CompletionError {
    /// The provider did not answer within the configured bound.
    #[error("upstream timed out after {0:?}")]
    UpstreamTimeout(Duration),

    /// The provider wants a tool result before it continues. No handler exists for this.
    #[error("upstream requires an action before continuing")]
    UpstreamRequiresAction,

    /// Terminal non-success status, a non-retryable transport error, or an exhausted retry budget.
    #[error("upstream failed: {0}")]
    UpstreamFailed(String),

    /// Provider output did not match the declared schema.
    ///
    /// Retried inside the client; callers only see it promoted to `UpstreamFailed`.
    #[error("schema parse failure: {0}")]
    SchemaParseFailure(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_and_server_errors_are_transient() {
        let rate_limited = OpenAIError::Api {
            status: 429,
            message: "slow down".into(),
        };
        let bad_gateway = OpenAIError::Api {
            status: 502,
            message: "bad gateway".into(),
        };
        assert!(rate_limited.is_transient());
        assert!(bad_gateway.is_transient());
        assert!(OpenAIError::Network("reset".into()).is_transient());
    }

    #[test]
    fn client_errors_are_not_transient() {
        let bad_request = OpenAIError::Api {
            status: 400,
            message: "invalid schema".into(),
        };
        assert!(!bad_request.is_transient());
        assert!(!OpenAIError::Config("no key".into()).is_transient());
    }
}
