// Belastingwijzer - answer engine core
//
// Streams answers to Dutch tax questions while enforcing per-organization
// usage limits. Domains hold the admission policy and the answer pipeline;
// the kernel holds infrastructure (connection pool, external clients,
// background tasks).

pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;

pub use config::*;
