//! Bounded pool of health-checked backing-store connections.
//!
//! Every connection is opened eagerly at startup. A borrower holds a
//! [`PooledConnection`] guard; dropping the guard hands the connection back,
//! or destroys it when the borrower marked it unhealthy.
//!
//! ```text
//! acquire()
//!     ├─► wait for a permit (bounded)
//!     ├─► pop idle connection ──► probe ──ok──► lease
//!     │                             └─fail──► destroy, open replacement ──► lease
//!     └─► transient failure ──► retry (bounded) ──► PoolError::Exhausted
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::{Connection, PgConnection};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::kernel::traits::BasePoolMonitor;

/// Opens and checks connections to a backing store.
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self) -> anyhow::Result<Self::Connection>;

    /// Cheap liveness round-trip.
    async fn probe(&self, conn: &mut Self::Connection) -> anyhow::Result<()>;
}

/// Postgres connections via sqlx.
pub struct PgConnectionManager {
    database_url: String,
}

impl PgConnectionManager {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }
}

#[async_trait]
impl ConnectionManager for PgConnectionManager {
    type Connection = PgConnection;

    async fn connect(&self) -> anyhow::Result<PgConnection> {
        Ok(PgConnection::connect(&self.database_url).await?)
    }

    async fn probe(&self, conn: &mut PgConnection) -> anyhow::Result<()> {
        Ok(conn.ping().await?)
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connection pool exhausted after {attempts} attempts: {reason}")]
    Exhausted { attempts: u32, reason: String },

    #[error("failed to open pooled connection: {0}")]
    Connect(String),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_size: usize,
    /// Bound on a single wait for a free connection.
    pub acquire_timeout: Duration,
    /// Extra attempts after a failed acquire.
    pub acquire_retries: u32,
    pub retry_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 5,
            acquire_timeout: Duration::from_secs(5),
            acquire_retries: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub max_size: usize,
    pub idle: usize,
    pub in_use: usize,
    pub created: u64,
    pub destroyed: u64,
}

struct PoolInner<M: ConnectionManager> {
    manager: M,
    config: PoolConfig,
    idle: Mutex<VecDeque<M::Connection>>,
    permits: Arc<Semaphore>,
    created: AtomicU64,
    destroyed: AtomicU64,
}

impl<M: ConnectionManager> PoolInner<M> {
    fn idle(&self) -> MutexGuard<'_, VecDeque<M::Connection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn open(&self) -> Result<M::Connection, String> {
        let conn = self.manager.connect().await.map_err(|e| e.to_string())?;
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    fn destroy(&self, conn: M::Connection) {
        drop(conn);
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Fixed-size connection pool.
pub struct ResourcePool<M: ConnectionManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ConnectionManager> Clone for ResourcePool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: ConnectionManager> ResourcePool<M> {
    /// Open `max_size` connections. Any failure here is fatal.
    pub async fn connect(manager: M, config: PoolConfig) -> Result<Self, PoolError> {
        let inner = PoolInner {
            idle: Mutex::new(VecDeque::with_capacity(config.max_size)),
            permits: Arc::new(Semaphore::new(config.max_size)),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            manager,
            config,
        };

        for _ in 0..inner.config.max_size {
            let conn = inner.open().await.map_err(PoolError::Connect)?;
            inner.idle().push_back(conn);
        }

        info!(max_size = inner.config.max_size, "connection pool ready");
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Lease a live connection.
    ///
    /// A connection that fails its probe is destroyed and replaced without the
    /// caller noticing. Waiting for a permit and opening a replacement are
    /// retried `acquire_retries` times before giving up.
    pub async fn acquire(&self) -> Result<PooledConnection<M>, PoolError> {
        let config = &self.inner.config;
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.try_acquire().await {
                Ok(conn) => return Ok(conn),
                Err(reason) if attempts > config.acquire_retries => {
                    warn!(attempts, reason = %reason, "connection pool exhausted");
                    return Err(PoolError::Exhausted { attempts, reason });
                }
                Err(reason) => {
                    debug!(attempt = attempts, reason = %reason, "acquire failed, retrying");
                    tokio::time::sleep(config.retry_delay).await;
                }
            }
        }
    }

    async fn try_acquire(&self) -> Result<PooledConnection<M>, String> {
        let inner = &self.inner;
        let permit = tokio::time::timeout(
            inner.config.acquire_timeout,
            inner.permits.clone().acquire_owned(),
        )
        .await
        .map_err(|_| "timed out waiting for a free connection".to_string())?
        .map_err(|_| "pool closed".to_string())?;

        let idle = inner.idle().pop_front();
        let conn = match idle {
            Some(mut conn) => {
                let probe = tokio::time::timeout(
                    inner.config.acquire_timeout,
                    inner.manager.probe(&mut conn),
                )
                .await;
                match probe {
                    Ok(Ok(())) => conn,
                    Ok(Err(e)) => {
                        warn!(error = %e, "pooled connection failed probe, replacing");
                        inner.destroy(conn);
                        inner.open().await?
                    }
                    Err(_) => {
                        warn!("pooled connection probe timed out, replacing");
                        inner.destroy(conn);
                        inner.open().await?
                    }
                }
            }
            // A connection destroyed earlier left a gap in the free-list
            None => inner.open().await?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            healthy: true,
            pool: inner.clone(),
            _permit: permit,
        })
    }

    pub fn status(&self) -> PoolStatus {
        let inner = &self.inner;
        PoolStatus {
            max_size: inner.config.max_size,
            idle: inner.idle().len(),
            in_use: inner.config.max_size - inner.permits.available_permits(),
            created: inner.created.load(Ordering::Relaxed),
            destroyed: inner.destroyed.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl<M: ConnectionManager> BasePoolMonitor for ResourcePool<M> {
    fn status(&self) -> PoolStatus {
        ResourcePool::status(self)
    }

    async fn check(&self) -> anyhow::Result<()> {
        self.acquire().await?;
        Ok(())
    }
}

/// A leased connection. Returned to the pool on drop.
pub struct PooledConnection<M: ConnectionManager> {
    conn: Option<M::Connection>,
    healthy: bool,
    pool: Arc<PoolInner<M>>,
    _permit: OwnedSemaphorePermit,
}

impl<M: ConnectionManager> PooledConnection<M> {
    /// Destroy this connection instead of returning it.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }
}

impl<M: ConnectionManager> fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("healthy", &self.healthy)
            .finish_non_exhaustive()
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &M::Connection {
        self.conn.as_ref().expect("connection is present until drop")
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut M::Connection {
        self.conn.as_mut().expect("connection is present until drop")
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        // The permit field drops after this body, so the connection is back
        // in the free-list before the next waiter wakes.
        if let Some(conn) = self.conn.take() {
            if self.is_healthy() {
                self.pool.idle().push_back(conn);
            } else {
                debug!("destroying unhealthy connection");
                self.pool.destroy(conn);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_dependencies::MockConnectionManager;

    fn config(max_size: usize) -> PoolConfig {
        PoolConfig {
            max_size,
            acquire_timeout: Duration::from_millis(100),
            acquire_retries: 1,
            retry_delay: Duration::from_millis(10),
        }
    }

    async fn pool(max_size: usize) -> (ResourcePool<MockConnectionManager>, MockConnectionManager) {
        let manager = MockConnectionManager::new();
        let pool = ResourcePool::connect(manager.clone(), config(max_size))
            .await
            .unwrap();
        (pool, manager)
    }

    #[tokio::test]
    async fn opens_every_connection_up_front() {
        let (pool, _) = pool(3).await;
        assert_eq!(
            pool.status(),
            PoolStatus {
                max_size: 3,
                idle: 3,
                in_use: 0,
                created: 3,
                destroyed: 0,
            }
        );
    }

    #[tokio::test]
    async fn startup_failure_is_fatal() {
        let manager = MockConnectionManager::new();
        manager.refuse_connections(true);

        let result = ResourcePool::connect(manager, config(2)).await;
        assert!(matches!(result, Err(PoolError::Connect(_))));
    }

    #[tokio::test]
    async fn healthy_connection_returns_on_drop() {
        let (pool, _) = pool(2).await;

        let conn = pool.acquire().await.unwrap();
        let id = conn.id;
        assert_eq!(pool.status().in_use, 1);
        drop(conn);

        let status = pool.status();
        assert_eq!(status.in_use, 0);
        assert_eq!(status.idle, 2);
        assert_eq!(status.destroyed, 0);

        // Returned connections go to the back of the free-list
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a.id, id);
        assert_eq!(b.id, id);
    }

    #[tokio::test]
    async fn failed_probe_is_replaced_transparently() {
        let (pool, manager) = pool(1).await;
        manager.break_connection(0);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id, 1);
        drop(conn);

        let status = pool.status();
        assert_eq!(status.created, 2);
        assert_eq!(status.destroyed, 1);
        assert_eq!(status.idle, 1);

        let again = pool.acquire().await.unwrap();
        assert_eq!(again.id, 1);
    }

    #[tokio::test]
    async fn unhealthy_connection_is_destroyed_on_release() {
        let (pool, _) = pool(1).await;

        let mut conn = pool.acquire().await.unwrap();
        assert!(conn.is_healthy());
        conn.mark_unhealthy();
        assert!(!conn.is_healthy());
        drop(conn);

        let status = pool.status();
        assert_eq!(status.idle, 0);
        assert_eq!(status.destroyed, 1);

        // The gap is filled on the next acquire
        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_after_bounded_retries() {
        let (pool, _) = pool(1).await;
        let _held = pool.acquire().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { attempts: 2, .. }));
        assert_eq!(pool.status().in_use, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_gets_released_connection() {
        let (pool, _) = pool(1).await;
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|c| c.id) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        assert_eq!(waiter.await.unwrap().unwrap(), 0);
        assert_eq!(pool.status().in_use, 0);
    }

    #[tokio::test]
    async fn acquire_parks_until_a_connection_is_released() {
        let (pool, _) = pool(1).await;
        let held = pool.acquire().await.unwrap();
        assert_eq!(format!("{:?}", held), "PooledConnection { healthy: true, .. }");

        let mut waiter = tokio_test::task::spawn(pool.acquire());
        tokio_test::assert_pending!(waiter.poll());

        drop(held);
        assert!(waiter.is_woken());
        let conn = tokio_test::assert_ready_ok!(waiter.poll());
        assert_eq!(conn.id, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_acquire_leaks_nothing() {
        let (pool, _) = pool(1).await;
        let held = pool.acquire().await.unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(5), pool.acquire()).await;
        assert!(pending.is_err());
        drop(held);

        let status = pool.status();
        assert_eq!(status.in_use, 0);
        assert_eq!(status.idle, 1);
    }
}
