//! Question answering pipeline.
//!
//! ```text
//! Idle → AdmissionCheck → Classifying → MetadataExtracted → Retrieving → Generating → Done
//!                 └──────────────┴──────────────┴─────────────┴────────────┴──► Error
//! ```
//!
//! The caller pulls [`StreamItem`]s one at a time; each phase only starts
//! once the previous item was taken. Dropping the stream cancels whatever
//! provider call is in flight.
//!
//! A request that carries an uploaded document skips classification and
//! retrieval and streams the answer from a single completion over the
//! document text.

use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_stream::{stream, try_stream};
use chrono::{Datelike, Utc};
use completion_client::{CompletionOptions, CompletionStream, StructuredCompletionClient};
use futures::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

use super::prompts::{
    answer_messages, classification_messages, document_messages, GENERIC_ERROR_MESSAGE,
    LIMIT_REACHED_MESSAGE, OVERAGE_CAP_MESSAGE, SIGNUP_MESSAGE,
};
use super::types::{AnswerDraft, ChatRequest, PhaseFlag, QuestionMetadata, StreamItem};
use crate::domains::admission::{AdmissionController, QuotaDecision};
use crate::kernel::traits::{BaseRetrievalService, BaseTextSanitizer};

pub type ChatStream = Pin<Box<dyn Stream<Item = StreamItem> + Send>>;

type PipelineStream = Pin<Box<dyn Stream<Item = Result<StreamItem>> + Send>>;

fn pipeline<S>(phases: S) -> PipelineStream
where
    S: Stream<Item = Result<StreamItem>> + Send + 'static,
{
    Box::pin(phases)
}

#[derive(Clone)]
pub struct QueryOrchestrator {
    admission: Arc<AdmissionController>,
    completions: StructuredCompletionClient,
    retrieval: Arc<dyn BaseRetrievalService>,
    sanitizer: Arc<dyn BaseTextSanitizer>,
}

impl QueryOrchestrator {
    pub fn new(
        admission: Arc<AdmissionController>,
        completions: StructuredCompletionClient,
        retrieval: Arc<dyn BaseRetrievalService>,
        sanitizer: Arc<dyn BaseTextSanitizer>,
    ) -> Self {
        Self {
            admission,
            completions,
            retrieval,
            sanitizer,
        }
    }

    /// Answer one question.
    ///
    /// The stream always ends on its own: after the answer, after a single
    /// admission message, or after exactly one [`StreamItem::Error`].
    pub fn answer(&self, request: ChatRequest) -> ChatStream {
        let this = self.clone();
        Box::pin(stream! {
            let org_id = request.org_id;

            match this.admission.consume_quota_if_available(org_id).await {
                QuotaDecision::Allowed { over_quota } => {
                    debug!(org_id = %org_id, over_quota, "request admitted");
                }
                QuotaDecision::QuotaExceeded => {
                    yield StreamItem::text(LIMIT_REACHED_MESSAGE);
                    return;
                }
                QuotaDecision::OverageCapReached => {
                    yield StreamItem::text(OVERAGE_CAP_MESSAGE);
                    return;
                }
                QuotaDecision::SubscriptionDenied => {
                    yield StreamItem::text(SIGNUP_MESSAGE);
                    return;
                }
                QuotaDecision::Unavailable => {
                    error!(org_id = %org_id, "admission unavailable");
                    yield StreamItem::Error(GENERIC_ERROR_MESSAGE.to_string());
                    return;
                }
            }

            let mut phases = if request.document.is_some() {
                this.clone().document_pipeline(request)
            } else {
                this.clone().question_pipeline(request)
            };

            while let Some(item) = phases.next().await {
                match item {
                    Ok(item) => yield item,
                    Err(e) => {
                        error!(org_id = %org_id, error = ?e, "chat pipeline failed");
                        yield StreamItem::Error(GENERIC_ERROR_MESSAGE.to_string());
                        return;
                    }
                }
            }
        })
    }

    fn question_pipeline(self, request: ChatRequest) -> PipelineStream {
        pipeline(try_stream! {
            yield StreamItem::Phase(PhaseFlag::AnalysisStarted);
            let metadata = self
                .completions
                .complete::<QuestionMetadata>(
                    classification_messages(&request.question, &request.history, Utc::now().year()),
                    CompletionOptions::default().temperature(0.0),
                )
                .await
                .context("question classification failed")?;
            info!(
                org_id = %request.org_id,
                topics = ?metadata.topics,
                years = ?metadata.years,
                confidence = ?metadata.confidence,
                "question classified"
            );
            yield StreamItem::Phase(PhaseFlag::AnalysisFinished);

            yield StreamItem::Phase(PhaseFlag::RetrievalStarted);
            let documents = self
                .retrieval
                .search(
                    &metadata.search_query,
                    &metadata.topics,
                    &metadata.years,
                    &request.history,
                )
                .await
                .context("document retrieval failed")?;
            debug!(
                org_id = %request.org_id,
                count = documents.len(),
                top_score = documents.first().map(|d| d.score),
                "documents retrieved"
            );
            yield StreamItem::Phase(PhaseFlag::DocsRetrieved);

            let drafts = self.completions.stream_complete::<AnswerDraft>(
                answer_messages(&request.question, &request.history, &documents),
                CompletionOptions::default(),
            );
            let mut fragments = self.forward_answer(drafts);
            while let Some(fragment) = fragments.next().await {
                yield fragment?;
            }
        })
    }

    fn document_pipeline(self, request: ChatRequest) -> PipelineStream {
        pipeline(try_stream! {
            let document = request
                .document
                .as_ref()
                .context("document pipeline without a document")?;
            info!(
                org_id = %request.org_id,
                filename = %document.filename,
                chars = document.text.chars().count(),
                "answering from uploaded document"
            );

            let drafts = self.completions.stream_complete::<AnswerDraft>(
                document_messages(&request.question, &request.history, document),
                CompletionOptions::default(),
            );
            let mut fragments = self.forward_answer(drafts);
            while let Some(fragment) = fragments.next().await {
                yield fragment?;
            }
        })
    }

    /// Turn partial drafts into sanitized text fragments.
    ///
    /// Each draft holds the whole answer so far; only the newly appended
    /// suffix is forwarded.
    fn forward_answer(&self, mut drafts: CompletionStream<AnswerDraft>) -> PipelineStream {
        let sanitizer = self.sanitizer.clone();
        pipeline(try_stream! {
            let mut sent = String::new();
            while let Some(draft) = drafts.next().await {
                let draft = draft.context("answer generation failed")?;
                if draft.answer.len() <= sent.len() {
                    continue;
                }
                let Some(suffix) = draft.answer.strip_prefix(sent.as_str()) else {
                    warn!(sent = sent.len(), received = draft.answer.len(), "answer snapshot diverged");
                    continue;
                };
                let fragment = sanitizer.sanitize(suffix);
                sent = draft.answer;
                if !fragment.is_empty() {
                    yield StreamItem::Text(fragment);
                }
            }
        })
    }
}
