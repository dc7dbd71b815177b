//! Streaming chat endpoints.
//!
//! POST /api/chat           JSON `{org_id, question, history}`
//! POST /api/chat/document  multipart `org_id`, `question`, `history`?, `file`
//!
//! Both respond with a chunked `text/plain` body. Each chunk is one protocol
//! unit: answer text, a phase sentinel (`AnalysisStarted`, ...), or a final
//! error message.

use std::convert::Infallible;

use axum::{
    body::Body,
    extract::{Extension, Multipart},
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE},
        StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use uuid::Uuid;

use crate::domains::chat::prompts::SIGNUP_MESSAGE;
use crate::domains::chat::{ChatRequest, ChatStream, ChatTurn, StreamItem, UploadedDocument};
use crate::server::app::AppState;

fn stream_response(stream: ChatStream) -> Response {
    let body = Body::from_stream(stream.map(|item| Ok::<_, Infallible>(item.into_wire())));
    (
        [
            (CONTENT_TYPE, "text/plain; charset=utf-8"),
            (CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, message.into()).into_response()
}

pub async fn chat_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<ChatRequest>,
) -> Response {
    if request.question.trim().is_empty() {
        return bad_request("question must not be empty");
    }
    if request.document.is_some() {
        return bad_request("documents are uploaded through /api/chat/document");
    }

    tracing::info!(org_id = %request.org_id, history = request.history.len(), "chat request");
    stream_response(state.orchestrator.answer(request))
}

/// Multipart document upload.
///
/// `org_id` must precede `file`: access is checked before the upload is read.
pub async fn chat_document_handler(
    Extension(state): Extension<AppState>,
    mut multipart: Multipart,
) -> Response {
    let mut org_id: Option<Uuid> = None;
    let mut question: Option<String> = None;
    let mut history: Vec<ChatTurn> = Vec::new();
    let mut document: Option<UploadedDocument> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return (e.status(), e.body_text()).into_response(),
        };

        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "org_id" => {
                let text = match field.text().await {
                    Ok(text) => text,
                    Err(e) => return (e.status(), e.body_text()).into_response(),
                };
                match Uuid::parse_str(text.trim()) {
                    Ok(id) => org_id = Some(id),
                    Err(_) => return bad_request("org_id must be a UUID"),
                }
            }
            "question" => match field.text().await {
                Ok(text) => question = Some(text),
                Err(e) => return (e.status(), e.body_text()).into_response(),
            },
            "history" => {
                let text = match field.text().await {
                    Ok(text) => text,
                    Err(e) => return (e.status(), e.body_text()).into_response(),
                };
                match serde_json::from_str(&text) {
                    Ok(turns) => history = turns,
                    Err(_) => return bad_request("history must be a JSON array of turns"),
                }
            }
            "file" => {
                let Some(org_id) = org_id else {
                    return bad_request("org_id must be sent before file");
                };
                if !state.deps.admission.has_access(org_id).await {
                    tracing::info!(org_id = %org_id, "document upload without access");
                    return stream_response(Box::pin(futures::stream::iter([StreamItem::text(
                        SIGNUP_MESSAGE,
                    )])));
                }

                let filename = field.file_name().unwrap_or("document").to_string();
                let bytes = match field.bytes().await {
                    Ok(bytes) => bytes,
                    Err(e) => return (e.status(), e.body_text()).into_response(),
                };
                let text = match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => return bad_request("document must be UTF-8 text"),
                };
                document = Some(UploadedDocument { filename, text });
            }
            other => {
                tracing::debug!(field = other, "ignoring unknown multipart field");
            }
        }
    }

    let Some(org_id) = org_id else {
        return bad_request("org_id is required");
    };
    let Some(question) = question.filter(|q| !q.trim().is_empty()) else {
        return bad_request("question is required");
    };
    let Some(document) = document else {
        return bad_request("file is required");
    };

    tracing::info!(
        org_id = %org_id,
        filename = %document.filename,
        bytes = document.text.len(),
        "document chat request"
    );

    let request = ChatRequest::new(org_id, question)
        .with_history(history)
        .with_document(document);
    stream_response(state.orchestrator.answer(request))
}
