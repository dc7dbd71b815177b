//! Test harness for integration testing.
//!
//! `AppHarness` drives the full axum router in-process over mock
//! collaborators; nothing touches the network. `SharedPostgres` starts one
//! Postgres container for the whole run and is only used by `#[ignore]`d
//! tests that need a real database.

use std::sync::Arc;

use anyhow::{Context, Result};
use assistant_core::domains::admission::PgQuotaStore;
use assistant_core::domains::chat::{ChatStream, PhaseFlag, StreamItem};
use assistant_core::kernel::test_dependencies::{LeasingQuotaStore, MockConnectionManager};
use assistant_core::kernel::{PgConnectionManager, PoolConfig, ResourcePool, TestDependencies};
use assistant_core::server::{build_app, AppState};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use tower::ServiceExt;

pub const ADMIN_TOKEN: &str = "test-admin-token";

/// Respect RUST_LOG. Run tests with: RUST_LOG=debug cargo test -- --nocapture
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Drain a chat stream.
pub async fn collect(stream: ChatStream) -> Vec<StreamItem> {
    stream.collect().await
}

pub fn phases(items: &[StreamItem]) -> Vec<PhaseFlag> {
    items
        .iter()
        .filter_map(|item| match item {
            StreamItem::Phase(flag) => Some(*flag),
            _ => None,
        })
        .collect()
}

pub fn answer_text(items: &[StreamItem]) -> String {
    items
        .iter()
        .filter_map(|item| match item {
            StreamItem::Text(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

pub fn errors(items: &[StreamItem]) -> usize {
    items.iter().filter(|item| item.is_error()).count()
}

/// A pool of mock connections with every quota operation leasing one.
pub async fn leasing_deps(
    deps: TestDependencies,
    max_size: usize,
) -> Result<(TestDependencies, ResourcePool<MockConnectionManager>)> {
    let pool = ResourcePool::connect(
        MockConnectionManager::new(),
        PoolConfig {
            max_size,
            ..PoolConfig::default()
        },
    )
    .await?;
    let store = Arc::new(LeasingQuotaStore::new(pool.clone(), deps.quotas.clone()));
    Ok((deps.quota_store(store), pool))
}

/// In-process HTTP harness.
pub struct AppHarness {
    pub deps: TestDependencies,
    pub pool: ResourcePool<MockConnectionManager>,
    pub router: Router,
}

impl AppHarness {
    pub async fn new(deps: TestDependencies) -> Result<Self> {
        Self::with_admin_token(deps, Some(ADMIN_TOKEN)).await
    }

    pub async fn with_admin_token(deps: TestDependencies, admin_token: Option<&str>) -> Result<Self> {
        init_tracing();
        let (deps, pool) = leasing_deps(deps, 2).await?;
        let state = AppState::new(
            deps.server_deps(),
            Arc::new(pool.clone()),
            admin_token.map(str::to_string),
        );
        Ok(Self {
            deps,
            pool,
            router: build_app(state),
        })
    }

    pub async fn send(&self, request: Request<Body>) -> Result<(StatusCode, String)> {
        let response = self.router.clone().oneshot(request).await?;
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .context("Failed to read response body")?;
        Ok((status, String::from_utf8_lossy(&bytes).into_owned()))
    }

    pub async fn post_json(&self, uri: &str, body: serde_json::Value) -> Result<(StatusCode, String)> {
        let request = Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))?;
        self.send(request).await
    }

    pub async fn post_admin(&self, uri: &str, token: Option<&str>) -> Result<(StatusCode, String)> {
        let mut request = Request::post(uri);
        if let Some(token) = token {
            request = request.header("x-admin-token", token);
        }
        self.send(request.body(Body::empty())?).await
    }

    pub async fn get(&self, uri: &str) -> Result<(StatusCode, String)> {
        self.send(Request::get(uri).body(Body::empty())?).await
    }
}

/// Multipart body with text fields followed by one file part.
pub fn multipart_body(boundary: &str, fields: &[(&str, &str)], file: Option<(&str, &str)>) -> String {
    let mut body = String::new();
    for (name, value) in fields {
        body.push_str(&format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
        ));
    }
    if let Some((filename, content)) = file {
        body.push_str(&format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: text/plain\r\n\r\n{content}\r\n"
        ));
    }
    body.push_str(&format!("--{boundary}--\r\n"));
    body
}

// =============================================================================
// Shared Postgres container
// =============================================================================

/// Containers are started once and reused, migrations run once.
pub struct SharedPostgres {
    pub db_url: String,
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_POSTGRES: OnceCell<SharedPostgres> = OnceCell::const_new();

impl SharedPostgres {
    async fn init() -> Result<Self> {
        init_tracing();

        let postgres = Postgres::default()
            .with_tag("16")
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let host = postgres.get_host().await?;
        let port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        let pool = ResourcePool::connect(
            PgConnectionManager::new(db_url.clone()),
            PoolConfig {
                max_size: 1,
                ..PoolConfig::default()
            },
        )
        .await?;
        let mut conn = pool.acquire().await?;
        sqlx::migrate!("./migrations")
            .run(&mut *conn)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            db_url,
            _postgres: postgres,
        })
    }

    pub async fn get() -> &'static Self {
        SHARED_POSTGRES
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared Postgres")
            })
            .await
    }

    pub async fn store(&self, max_size: usize) -> Result<PgQuotaStore> {
        let pool = ResourcePool::connect(
            PgConnectionManager::new(self.db_url.clone()),
            PoolConfig {
                max_size,
                ..PoolConfig::default()
            },
        )
        .await?;
        Ok(PgQuotaStore::new(pool))
    }
}
