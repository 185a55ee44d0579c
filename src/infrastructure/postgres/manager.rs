//! Pool lifecycle and scoped connection acquisition.
//!
//! A [`PoolManager`] owns at most one pool at a time. [`PoolManager::enter`]
//! borrows a connection, rebuilding the whole pool when the borrow fails at
//! the pool level, and hands it out inside a [`ConnectionGuard`] that returns
//! it on drop.
//!
//! Rebuilds are single-flight: each pool carries a generation number and a
//! caller only rebuilds if the pool it failed against is still current.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::config::{DatabaseSettings, DbConfig};
use crate::error::ServiceError;
use crate::infrastructure::backoff::{BackoffConfig, ExponentialBackoff};

use super::backend::{BackendError, ConnectionPool, PoolBackend, PoolOptions};
use super::events::{PoolEvents, TracingEvents};

pub const RETRIES_EXCEEDED: &str = "Postgres error getting connection retry exceeded";
pub const GENERAL_ACQUIRE_ERROR: &str = "General error getting connection from pool";

struct PoolSlot<P> {
    pool: Arc<P>,
    generation: u64,
}

/// Point-in-time view of the manager.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStatus {
    pub open: bool,
    pub generation: u64,
    pub size: u32,
    pub idle: usize,
    pub checked_out: usize,
    pub rebuilds: u64,
}

pub struct PoolManager<B: PoolBackend> {
    config: Arc<DbConfig>,
    backend: B,
    options: PoolOptions,
    acquire_attempts: u32,
    backoff: BackoffConfig,
    events: Arc<dyn PoolEvents>,
    pool: RwLock<Option<PoolSlot<B::Pool>>>,
    /// Serializes create, close and rebuild.
    lifecycle: Mutex<()>,
    next_generation: AtomicU64,
    rebuilds: AtomicU64,
    checked_out: Arc<AtomicUsize>,
}

impl<B: PoolBackend> PoolManager<B> {
    pub fn new(config: Arc<DbConfig>, backend: B) -> Self {
        Self {
            config,
            backend,
            options: PoolOptions::default(),
            acquire_attempts: 3,
            backoff: BackoffConfig::default(),
            events: Arc::new(TracingEvents),
            pool: RwLock::new(None),
            lifecycle: Mutex::new(()),
            next_generation: AtomicU64::new(1),
            rebuilds: AtomicU64::new(0),
            checked_out: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn from_settings(config: Arc<DbConfig>, backend: B, settings: &DatabaseSettings) -> Self {
        Self::new(config, backend)
            .with_options(PoolOptions::from(settings))
            .with_acquire_attempts(settings.acquire_attempts)
    }

    pub fn with_options(mut self, options: PoolOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_acquire_attempts(mut self, attempts: u32) -> Self {
        self.acquire_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn PoolEvents>) -> Self {
        self.events = events;
        self
    }

    pub fn encryption_key(&self) -> &str {
        self.config.encryption_key()
    }

    pub fn config(&self) -> &Arc<DbConfig> {
        &self.config
    }

    /// Open the pool. Fails if one is already open.
    pub async fn create_pool(&self) -> Result<(), ServiceError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.create_locked().await
    }

    /// Close the pool. The manager is left without a pool even if closing
    /// fails; after a failure the old pool may be partially closed.
    pub async fn close_pool(&self) -> Result<(), ServiceError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.close_locked().await
    }

    async fn create_locked(&self) -> Result<(), ServiceError> {
        if self.pool.read().await.is_some() {
            return Err(ServiceError::unavailable("connection pool already open"));
        }

        self.events.info("Creating connection pool");

        let connection_string = self.config.resolve_connection_string().await.map_err(|e| {
            self.events.error(&format!("Error: {}", e));
            ServiceError::unavailable(format!("Postgres error opening pool: {}", e.detail()))
        })?;

        let pool = self
            .backend
            .open(&connection_string, &self.options)
            .await
            .map_err(|e| {
                self.events.error(&format!("Postgres error: {}", e));
                ServiceError::unavailable(format!("Postgres error opening pool: {}", e))
            })?;

        let generation = self.next_generation.fetch_add(1, Ordering::AcqRel);
        *self.pool.write().await = Some(PoolSlot {
            pool: Arc::new(pool),
            generation,
        });

        self.events.info("Connection pool created");
        tracing::debug!(generation, "Connection pool generation installed");
        Ok(())
    }

    async fn close_locked(&self) -> Result<(), ServiceError> {
        let slot = self
            .pool
            .write()
            .await
            .take()
            .ok_or_else(|| ServiceError::unavailable("connection pool is not open"))?;

        self.events.info("Closing connection pool");

        slot.pool.close().await.map_err(|e| {
            self.events.error(&format!("Postgres error: {}", e));
            ServiceError::unavailable(format!("Postgres error closing pool: {}", e))
        })
    }

    /// Current pool and its generation, creating one if none is open.
    async fn current_pool(&self) -> Result<(Arc<B::Pool>, u64), ServiceError> {
        if let Some(slot) = self.pool.read().await.as_ref() {
            return Ok((slot.pool.clone(), slot.generation));
        }

        let _lifecycle = self.lifecycle.lock().await;
        if self.pool.read().await.is_none() {
            self.create_locked().await?;
        }

        self.pool
            .read()
            .await
            .as_ref()
            .map(|slot| (slot.pool.clone(), slot.generation))
            .ok_or_else(|| ServiceError::unavailable("connection pool is not open"))
    }

    /// Close and recreate the pool, unless the pool that failed has already
    /// been replaced by another caller.
    async fn rebuild(&self, failed_generation: u64) -> Result<(), ServiceError> {
        let _lifecycle = self.lifecycle.lock().await;

        let current = self.pool.read().await.as_ref().map(|slot| slot.generation);
        match current {
            Some(generation) if generation != failed_generation => {
                tracing::debug!(
                    failed_generation,
                    current_generation = generation,
                    "Pool already rebuilt by another caller"
                );
                return Ok(());
            }
            // Graceful close of active connections before reopening
            Some(_) => self.close_locked().await?,
            None => {}
        }

        self.create_locked().await?;
        self.rebuilds.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Borrow a connection, rebuilding the pool on pool-level failures.
    pub async fn enter(&self) -> Result<ConnectionGuard<B::Pool>, ServiceError> {
        let mut backoff = ExponentialBackoff::with_config(self.backoff.clone());

        for attempt in 1..=self.acquire_attempts {
            let (pool, generation) = self.current_pool().await?;

            match pool.acquire().await {
                Ok(conn) => {
                    return Ok(ConnectionGuard::new(conn, pool, self.checked_out.clone()));
                }
                Err(BackendError::Pool(e)) => {
                    self.events
                        .error(&format!("Postgres error getting connection from pool: {}", e));
                    self.events.error(&format!("Retry: {}", attempt));

                    self.rebuild(generation).await?;

                    if attempt < self.acquire_attempts {
                        let delay = backoff.next_delay();
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
                Err(BackendError::Unexpected(e)) => {
                    self.events
                        .error(&format!("General error getting connection from pool: {}", e));
                    return Err(ServiceError::unavailable(GENERAL_ACQUIRE_ERROR));
                }
            }
        }

        Err(ServiceError::unavailable(RETRIES_EXCEEDED))
    }

    /// Run `body` with a borrowed connection, releasing it afterwards.
    pub async fn with_connection<F, T>(&self, body: F) -> Result<T, ServiceError>
    where
        F: for<'c> FnOnce(
            &'c mut <B::Pool as ConnectionPool>::Connection,
        ) -> BoxFuture<'c, Result<T, ServiceError>>,
    {
        let mut guard = self.enter().await?;
        body(&mut *guard).await
    }

    /// Number of connections currently handed out.
    pub fn checked_out(&self) -> usize {
        self.checked_out.load(Ordering::Acquire)
    }

    pub async fn is_open(&self) -> bool {
        self.pool.read().await.is_some()
    }

    pub async fn status(&self) -> PoolStatus {
        let pool = self.pool.read().await;
        let (open, generation, size, idle) = match pool.as_ref() {
            Some(slot) => (true, slot.generation, slot.pool.size(), slot.pool.idle()),
            None => (false, 0, 0, 0),
        };

        PoolStatus {
            open,
            generation,
            size,
            idle,
            checked_out: self.checked_out(),
            rebuilds: self.rebuilds.load(Ordering::Acquire),
        }
    }
}

/// A borrowed connection. Returned to its pool when dropped.
pub struct ConnectionGuard<P: ConnectionPool> {
    conn: Option<P::Connection>,
    pool: Arc<P>,
    checked_out: Arc<AtomicUsize>,
}

const RELEASED: &str = "connection already released";

impl<P: ConnectionPool> ConnectionGuard<P> {
    fn new(conn: P::Connection, pool: Arc<P>, checked_out: Arc<AtomicUsize>) -> Self {
        checked_out.fetch_add(1, Ordering::AcqRel);
        Self {
            conn: Some(conn),
            pool,
            checked_out,
        }
    }

    /// Pool the connection was borrowed from.
    pub fn pool(&self) -> &Arc<P> {
        &self.pool
    }

    /// Release the connection now instead of at end of scope.
    pub fn exit(self) {
        drop(self);
    }
}

impl<P: ConnectionPool> Deref for ConnectionGuard<P> {
    type Target = P::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect(RELEASED)
    }
}

impl<P: ConnectionPool> DerefMut for ConnectionGuard<P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect(RELEASED)
    }
}

impl<P: ConnectionPool> Drop for ConnectionGuard<P> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
            self.checked_out.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::identity::{AccessToken, IdentityError, TokenProvider};
    use std::sync::atomic::AtomicBool;

    struct NoIdentity;

    #[async_trait::async_trait]
    impl TokenProvider for NoIdentity {
        async fn get_token(&self, _scope: &str) -> Result<AccessToken, IdentityError> {
            Err(IdentityError::Unavailable("not configured".into()))
        }
    }

    /// Single-connection pool that fails the first borrow when asked to.
    struct OneShotPool {
        idle: AtomicUsize,
        fail_first: AtomicBool,
    }

    #[async_trait::async_trait]
    impl ConnectionPool for OneShotPool {
        type Connection = u32;

        async fn acquire(&self) -> Result<u32, BackendError> {
            if self.fail_first.swap(false, Ordering::SeqCst) {
                return Err(BackendError::Pool("stale connection".into()));
            }
            self.idle.fetch_sub(1, Ordering::SeqCst);
            Ok(7)
        }

        fn release(&self, _conn: u32) {
            self.idle.fetch_add(1, Ordering::SeqCst);
        }

        async fn ping(&self, _conn: &mut u32) -> Result<(), BackendError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), BackendError> {
            Ok(())
        }

        fn size(&self) -> u32 {
            1
        }

        fn idle(&self) -> usize {
            self.idle.load(Ordering::SeqCst)
        }
    }

    /// Only the first pool it opens fails its first borrow.
    struct OneShotBackend {
        fail_first_borrow: AtomicBool,
    }

    #[async_trait::async_trait]
    impl PoolBackend for OneShotBackend {
        type Pool = OneShotPool;

        async fn open(&self, _url: &str, _options: &PoolOptions) -> Result<OneShotPool, BackendError> {
            Ok(OneShotPool {
                idle: AtomicUsize::new(1),
                fail_first: AtomicBool::new(self.fail_first_borrow.swap(false, Ordering::SeqCst)),
            })
        }
    }

    fn manager(fail_first_borrow: bool) -> PoolManager<OneShotBackend> {
        let settings = DatabaseSettings {
            server: Some("db.local".into()),
            user: Some("svc".into()),
            password: Some("secret".into()),
            encryption_key: Some("k1".into()),
            ..DatabaseSettings::default()
        };
        let config = Arc::new(DbConfig::new(settings, Arc::new(NoIdentity)).unwrap());
        PoolManager::new(
            config,
            OneShotBackend {
                fail_first_borrow: AtomicBool::new(fail_first_borrow),
            },
        )
        .with_backoff(BackoffConfig::none())
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let manager = manager(false);
        assert!(!manager.is_open().await);

        manager.create_pool().await.unwrap();
        assert!(manager.is_open().await);
        assert!(manager.create_pool().await.is_err());

        manager.close_pool().await.unwrap();
        assert!(!manager.is_open().await);
        assert!(manager.close_pool().await.is_err());
    }

    #[tokio::test]
    async fn test_enter_creates_pool_lazily() {
        let manager = manager(false);

        let guard = manager.enter().await.unwrap();
        assert_eq!(*guard, 7);
        assert_eq!(manager.checked_out(), 1);

        let status = manager.status().await;
        assert!(status.open);
        assert_eq!(status.generation, 1);
        assert_eq!(status.idle, 0);

        guard.exit();
        assert_eq!(manager.checked_out(), 0);
        assert_eq!(manager.status().await.idle, 1);
    }

    #[tokio::test]
    async fn test_rebuild_bumps_generation() {
        let manager = manager(true);

        let guard = manager.enter().await.unwrap();
        drop(guard);

        let status = manager.status().await;
        assert_eq!(status.generation, 2);
        assert_eq!(status.rebuilds, 1);
    }

    #[tokio::test]
    async fn test_stale_generation_skips_rebuild() {
        let manager = manager(false);
        manager.create_pool().await.unwrap();

        manager.rebuild(1).await.unwrap();
        assert_eq!(manager.status().await.generation, 2);

        // A caller that failed against generation 1 arrives late
        manager.rebuild(1).await.unwrap();
        let status = manager.status().await;
        assert_eq!(status.generation, 2);
        assert_eq!(status.rebuilds, 1);
    }

    #[tokio::test]
    async fn test_with_connection_releases() {
        let manager = manager(false);

        let value = manager
            .with_connection(|conn| Box::pin(async move { Ok(*conn + 1) }))
            .await
            .unwrap();

        assert_eq!(value, 8);
        assert_eq!(manager.checked_out(), 0);
        assert_eq!(manager.status().await.idle, 1);
    }

    #[tokio::test]
    async fn test_encryption_key_passthrough() {
        assert_eq!(manager(false).encryption_key(), "k1");
    }
}
