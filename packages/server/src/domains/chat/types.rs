use std::collections::BTreeSet;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dutch tax areas a question can touch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum Topic {
    Omzetbelasting,
    Inkomstenbelasting,
    Vennootschapsbelasting,
    Loonheffingen,
    Erfbelasting,
    Schenkbelasting,
    Overdrachtsbelasting,
    Douane,
    Toeslagen,
    Overig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// What the classification phase extracts from a question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct QuestionMetadata {
    /// Tax areas the question is about.
    pub topics: BTreeSet<Topic>,
    /// Tax years the question refers to. Current year when none is mentioned.
    pub years: BTreeSet<i32>,
    /// Self-contained search query for the document index.
    pub search_query: String,
    pub confidence: Confidence,
}

/// Shape of the generated answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AnswerDraft {
    /// The answer shown to the user, in Markdown.
    pub answer: String,
    /// Titles of the documents the answer relies on.
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

/// Plain-text document uploaded alongside a question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedDocument {
    pub filename: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub org_id: Uuid,
    pub question: String,
    #[serde(default)]
    pub history: Vec<ChatTurn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<UploadedDocument>,
}

impl ChatRequest {
    pub fn new(org_id: Uuid, question: impl Into<String>) -> Self {
        Self {
            org_id,
            question: question.into(),
            history: Vec::new(),
            document: None,
        }
    }

    pub fn with_history(mut self, history: Vec<ChatTurn>) -> Self {
        self.history = history;
        self
    }

    pub fn with_document(mut self, document: UploadedDocument) -> Self {
        self.document = Some(document);
        self
    }
}

/// Pipeline phase boundaries, in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PhaseFlag {
    AnalysisStarted,
    AnalysisFinished,
    RetrievalStarted,
    DocsRetrieved,
}

impl PhaseFlag {
    /// The literal sentinel token sent to clients.
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseFlag::AnalysisStarted => "AnalysisStarted",
            PhaseFlag::AnalysisFinished => "AnalysisFinished",
            PhaseFlag::RetrievalStarted => "RetrievalStarted",
            PhaseFlag::DocsRetrieved => "DocsRetrieved",
        }
    }
}

impl fmt::Display for PhaseFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of a chat response stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    /// Sanitized answer text.
    Text(String),
    Phase(PhaseFlag),
    /// User-safe message. Always the last item.
    Error(String),
}

impl StreamItem {
    pub fn text(text: impl Into<String>) -> Self {
        StreamItem::Text(text.into())
    }

    /// Render as a protocol unit: the text itself, the sentinel name, or the
    /// error message.
    pub fn to_wire(&self) -> &str {
        match self {
            StreamItem::Text(text) => text,
            StreamItem::Phase(flag) => flag.as_str(),
            StreamItem::Error(message) => message,
        }
    }

    pub fn into_wire(self) -> String {
        match self {
            StreamItem::Text(text) | StreamItem::Error(text) => text,
            StreamItem::Phase(flag) => flag.as_str().to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StreamItem::Error(_))
    }
}
