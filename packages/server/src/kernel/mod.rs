//! Kernel module - server infrastructure and dependencies.

pub mod billing_client;
pub mod deps;
pub mod pool;
pub mod retrieval_client;
pub mod sanitizer;
pub mod scheduled_tasks;
pub mod test_dependencies;
pub mod traits;

pub use billing_client::StripeBillingClient;
pub use deps::ServerDeps;
pub use pool::{
    ConnectionManager, PgConnectionManager, PoolConfig, PoolError, PoolStatus, PooledConnection,
    ResourcePool,
};
pub use retrieval_client::HttpRetrievalClient;
pub use sanitizer::PassthroughSanitizer;
pub use scheduled_tasks::{SubscriptionRefreshTask, DEFAULT_REFRESH_INTERVAL};
pub use test_dependencies::TestDependencies;
pub use traits::*;
