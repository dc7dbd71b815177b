// Admission domain - decides whether a chat request may run
//
// Responsibilities:
// - Subscription gate (active subscription or running trial)
// - Atomic trial/paid quota consumption
// - Metered overage reporting
// - Subscription refresh from billing (on demand and periodic)

pub mod controller;
pub mod models;
pub mod store;

pub use controller::{AdmissionController, AdmissionPolicy, QuotaDecision};
pub use models::QuotaState;
pub use store::{MemoryQuotaStore, PgQuotaStore, QuotaStore};
