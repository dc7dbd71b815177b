// Chat domain - turns a question into a streamed answer
//
// Responsibilities:
// - Admission before any costly work
// - Question classification into structured metadata
// - Document retrieval via the external search service
// - Streaming answer generation with phase flags

pub mod orchestrator;
pub mod prompts;
pub mod types;

pub use orchestrator::{ChatStream, QueryOrchestrator};
pub use types::*;
