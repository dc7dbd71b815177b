//! Scripted [`CompletionProvider`] for tests.
//!
//! Replies and streams are queued up front and consumed in order. Every
//! request the provider sees is recorded.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};

use crate::error::{OpenAIError, Result};
use crate::provider::{CompletionProvider, CompletionStatus, DeltaStream, ProviderResponse};
use crate::streaming::ChatCompletionChunk;
use crate::types::StructuredRequest;

/// A queued answer for [`CompletionProvider::create`].
#[derive(Debug)]
pub enum MockReply {
    Json(String),
    Status(CompletionStatus),
    Error(OpenAIError),
    /// Never resolves.
    Hang,
}

impl MockReply {
    pub fn json(content: impl Into<String>) -> Self {
        MockReply::Json(content.into())
    }

    pub fn value<T: serde::Serialize>(value: &T) -> Self {
        MockReply::Json(serde_json::to_string(value).unwrap_or_default())
    }
}

/// A queued answer for [`CompletionProvider::create_stream`].
#[derive(Debug)]
pub enum MockStream {
    /// Deltas followed by a `stop` finish.
    Deltas(Vec<String>),
    /// Deltas followed by the given finish reason.
    Finish(Vec<String>, String),
    /// Deltas, then silence.
    HangAfter(Vec<String>),
    /// Deltas each preceded by the given delay, then a `stop` finish.
    Paced(Vec<String>, Duration),
    /// Deltas, then a transport error mid-stream.
    BreakAfter(Vec<String>, OpenAIError),
    /// Opening the stream fails.
    Error(OpenAIError),
}

impl MockStream {
    pub fn deltas<I, S>(deltas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MockStream::Deltas(deltas.into_iter().map(Into::into).collect())
    }

    /// The serialized `value` split into `chunk_size`-character deltas.
    pub fn chunked<T: serde::Serialize>(value: &T, chunk_size: usize) -> Self {
        let text = serde_json::to_string(value).unwrap_or_default();
        let chars: Vec<char> = text.chars().collect();
        MockStream::Deltas(
            chars
                .chunks(chunk_size.max(1))
                .map(|c| c.iter().collect())
                .collect(),
        )
    }
}

#[derive(Default)]
pub struct MockProvider {
    replies: Mutex<VecDeque<MockReply>>,
    streams: Mutex<VecDeque<MockStream>>,
    requests: Arc<Mutex<Vec<StructuredRequest>>>,
    open_streams: Arc<AtomicUsize>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(self, reply: MockReply) -> Self {
        self.push_reply(reply);
        self
    }

    pub fn with_stream(self, stream: MockStream) -> Self {
        self.push_stream(stream);
        self
    }

    pub fn push_reply(&self, reply: MockReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn push_stream(&self, stream: MockStream) {
        self.streams.lock().unwrap().push_back(stream);
    }

    /// Every request seen so far, in order.
    pub fn requests(&self) -> Vec<StructuredRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Delta streams handed out and not yet dropped.
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    fn record(&self, request: &StructuredRequest) {
        self.requests.lock().unwrap().push(request.clone());
    }

    fn track(&self, inner: DeltaStream) -> DeltaStream {
        self.open_streams.fetch_add(1, Ordering::SeqCst);
        Box::pin(TrackedStream {
            inner,
            open: Arc::clone(&self.open_streams),
        })
    }
}

/// Decrements the provider's open-stream count when dropped.
struct TrackedStream {
    inner: DeltaStream,
    open: Arc<AtomicUsize>,
}

impl Stream for TrackedStream {
    type Item = Result<ChatCompletionChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

fn delta_chunks(deltas: Vec<String>) -> Vec<Result<ChatCompletionChunk>> {
    deltas
        .into_iter()
        .map(|d| Ok(ChatCompletionChunk::delta(d)))
        .collect()
}

#[async_trait]
impl CompletionProvider for MockProvider {
    async fn create(&self, request: &StructuredRequest) -> Result<ProviderResponse> {
        self.record(request);
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(MockReply::Json(content)) => Ok(ProviderResponse::completed(content)),
            Some(MockReply::Status(status)) => Ok(ProviderResponse {
                status,
                content: None,
                usage: None,
            }),
            Some(MockReply::Error(e)) => Err(e),
            Some(MockReply::Hang) => futures::future::pending().await,
            None => Err(OpenAIError::Config("no mock reply queued".into())),
        }
    }

    async fn create_stream(&self, request: &StructuredRequest) -> Result<DeltaStream> {
        self.record(request);
        let scripted = self.streams.lock().unwrap().pop_front();
        match scripted {
            Some(MockStream::Deltas(deltas)) => {
                let mut chunks = delta_chunks(deltas);
                chunks.push(Ok(ChatCompletionChunk::finished("stop")));
                chunks.push(Ok(ChatCompletionChunk::done()));
                Ok(self.track(Box::pin(stream::iter(chunks))))
            }
            Some(MockStream::Finish(deltas, reason)) => {
                let mut chunks = delta_chunks(deltas);
                chunks.push(Ok(ChatCompletionChunk::finished(reason)));
                Ok(self.track(Box::pin(stream::iter(chunks))))
            }
            Some(MockStream::HangAfter(deltas)) => Ok(self.track(Box::pin(
                stream::iter(delta_chunks(deltas)).chain(stream::pending()),
            ))),
            Some(MockStream::Paced(deltas, delay)) => {
                let mut chunks = delta_chunks(deltas);
                chunks.push(Ok(ChatCompletionChunk::finished("stop")));
                let paced = stream::iter(chunks).then(move |chunk| async move {
                    tokio::time::sleep(delay).await;
                    chunk
                });
                Ok(self.track(Box::pin(paced)))
            }
            Some(MockStream::BreakAfter(deltas, e)) => {
                let mut chunks = delta_chunks(deltas);
                chunks.push(Err(e));
                Ok(self.track(Box::pin(stream::iter(chunks))))
            }
            Some(MockStream::Error(e)) => Err(e),
            None => Err(OpenAIError::Config("no mock stream queued".into())),
        }
    }
}
