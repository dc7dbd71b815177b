//! Server dependencies (using traits for testability)
//!
//! Central dependency container shared by the HTTP handlers and background
//! tasks. All external services sit behind trait abstractions.

use std::sync::Arc;

use completion_client::StructuredCompletionClient;

use crate::domains::admission::AdmissionController;
use crate::domains::chat::QueryOrchestrator;
use crate::kernel::{BaseBillingProvider, BaseRetrievalService, BaseTextSanitizer};

// =============================================================================
// ServerDeps
// =============================================================================

#[derive(Clone)]
pub struct ServerDeps {
    /// Built once at startup; the only admission instance in the process.
    pub admission: Arc<AdmissionController>,
    pub completions: StructuredCompletionClient,
    pub retrieval: Arc<dyn BaseRetrievalService>,
    pub sanitizer: Arc<dyn BaseTextSanitizer>,
    pub billing: Arc<dyn BaseBillingProvider>,
}

impl ServerDeps {
    pub fn new(
        admission: Arc<AdmissionController>,
        completions: StructuredCompletionClient,
        retrieval: Arc<dyn BaseRetrievalService>,
        sanitizer: Arc<dyn BaseTextSanitizer>,
        billing: Arc<dyn BaseBillingProvider>,
    ) -> Self {
        Self {
            admission,
            completions,
            retrieval,
            sanitizer,
            billing,
        }
    }

    pub fn orchestrator(&self) -> QueryOrchestrator {
        QueryOrchestrator::new(
            self.admission.clone(),
            self.completions.clone(),
            self.retrieval.clone(),
            self.sanitizer.clone(),
        )
    }
}
