//! SSE streaming parser for OpenAI chat completions.
//!
//! Converts a raw `reqwest` byte stream into `ChatCompletionChunk` values.
//! Handles `data: [DONE]`, partial lines split across network reads, and
//! the `finish_reason` carried by the last content chunk.

use bytes::Bytes;
use futures::stream::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::OpenAIError;

/// A single chunk from a streaming chat completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatCompletionChunk {
    /// The text delta for this chunk.
    pub delta: String,
    /// Set on the final choice chunk (`stop`, `length`, `tool_calls`, ...).
    pub finish_reason: Option<String>,
    /// Whether the stream is done (`data: [DONE]`).
    pub done: bool,
}

impl ChatCompletionChunk {
    /// A content delta.
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta: text.into(),
            ..Default::default()
        }
    }

    /// A chunk carrying only a finish reason.
    pub fn finished(reason: impl Into<String>) -> Self {
        Self {
            finish_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    /// The `[DONE]` marker.
    pub fn done() -> Self {
        Self {
            done: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct StreamChunkRaw {
    choices: Vec<StreamChoiceRaw>,
}

#[derive(Debug, serde::Deserialize)]
struct StreamChoiceRaw {
    delta: DeltaRaw,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct DeltaRaw {
    #[serde(default)]
    content: Option<String>,
}

/// Stream adapter that converts raw SSE bytes into `ChatCompletionChunk` values.
pub struct ChatCompletionStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    buffer: String,
}

impl ChatCompletionStream {
    pub(crate) fn new(
        byte_stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            buffer: String::new(),
        }
    }
}

impl Stream for ChatCompletionStream {
    type Item = Result<ChatCompletionChunk, OpenAIError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(chunk) = try_parse_line(&mut this.buffer) {
                return Poll::Ready(Some(chunk));
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => this.buffer.push_str(text),
                    Err(e) => {
                        return Poll::Ready(Some(Err(OpenAIError::Parse(format!(
                            "Invalid UTF-8 in stream: {}",
                            e
                        )))));
                    }
                },
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(OpenAIError::Network(e.to_string()))));
                }
                Poll::Ready(None) => {
                    // A final line without trailing newline still counts
                    if !this.buffer.trim().is_empty() && !this.buffer.ends_with('\n') {
                        this.buffer.push('\n');
                        if let Some(chunk) = try_parse_line(&mut this.buffer) {
                            return Poll::Ready(Some(chunk));
                        }
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Try to extract and parse a complete SSE line from the buffer.
/// Returns `None` if no complete data line is available yet.
fn try_parse_line(buffer: &mut String) -> Option<Result<ChatCompletionChunk, OpenAIError>> {
    loop {
        let newline_pos = buffer.find('\n')?;
        let line = buffer[..newline_pos].trim().to_string();
        buffer.drain(..=newline_pos);

        if line.is_empty() {
            continue;
        }

        // Skip "event:", "id:", "retry:" and comments
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();

        if data == "[DONE]" {
            return Some(Ok(ChatCompletionChunk::done()));
        }

        return Some(
            serde_json::from_str::<StreamChunkRaw>(data)
                .map(|raw| {
                    let choice = raw.choices.into_iter().next();
                    let finish_reason = choice.as_ref().and_then(|c| c.finish_reason.clone());
                    let delta = choice.and_then(|c| c.delta.content).unwrap_or_default();
                    ChatCompletionChunk {
                        delta,
                        finish_reason,
                        done: false,
                    }
                })
                .map_err(|e| {
                    OpenAIError::Parse(format!(
                        "Failed to parse stream chunk: {} (data: {})",
                        e,
                        &data[..data.len().min(200)]
                    ))
                }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn sse(lines: &[&str]) -> ChatCompletionStream {
        let data: Vec<Result<Bytes, reqwest::Error>> = lines
            .iter()
            .map(|line| Ok(Bytes::from(format!("{}\n", line))))
            .collect();
        ChatCompletionStream::new(futures::stream::iter(data))
    }

    #[tokio::test]
    async fn parses_content_deltas_until_done() {
        let mut stream = sse(&[
            r#"data: {"choices":[{"delta":{"content":"{\"answer\":"}}]}"#,
            "",
            r#"data: {"choices":[{"delta":{"content":" \"9%\"}"}}]}"#,
            "",
            "data: [DONE]",
        ]);

        assert_eq!(stream.next().await.unwrap().unwrap().delta, "{\"answer\":");
        assert_eq!(stream.next().await.unwrap().unwrap().delta, " \"9%\"}");
        assert!(stream.next().await.unwrap().unwrap().done);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn captures_finish_reason() {
        let mut stream = sse(&[
            r#"data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            "data: [DONE]",
        ]);

        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(chunk.delta, "");
        assert_eq!(chunk.finish_reason.as_deref(), Some("tool_calls"));
    }

    #[tokio::test]
    async fn joins_lines_split_across_reads() {
        let parts: Vec<Result<Bytes, reqwest::Error>> = vec![
            Ok(Bytes::from(r#"data: {"choices":[{"delta":{"con"#)),
            Ok(Bytes::from("tent\":\"Hallo\"}}]}\n\n")),
        ];
        let mut stream = ChatCompletionStream::new(futures::stream::iter(parts));

        assert_eq!(stream.next().await.unwrap().unwrap().delta, "Hallo");
    }

    #[tokio::test]
    async fn malformed_chunk_is_a_parse_error() {
        let mut stream = sse(&["data: {not json"]);
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, OpenAIError::Parse(_)));
    }
}
