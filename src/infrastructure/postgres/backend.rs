//! Pool boundary used by the [`PoolManager`](super::PoolManager).

use std::time::Duration;

use thiserror::Error;

use crate::config::DatabaseSettings;

/// Failure reported by a pool backend.
///
/// `Pool` failures are attributable to the database or the pool and are
/// worth a rebuild; `Unexpected` failures are not retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("{0}")]
    Pool(String),

    #[error("{0}")]
    Unexpected(String),
}

impl BackendError {
    pub fn is_pool_level(&self) -> bool {
        matches!(self, BackendError::Pool(_))
    }
}

/// Sizing and timing for a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    pub max_connections: u32,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: 30,
            idle_timeout: Duration::from_secs(180),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&DatabaseSettings> for PoolOptions {
    fn from(settings: &DatabaseSettings) -> Self {
        Self {
            max_connections: settings.max_connections,
            idle_timeout: Duration::from_secs(settings.idle_timeout_seconds),
            acquire_timeout: Duration::from_secs(settings.acquire_timeout_seconds),
        }
    }
}

/// Opens pools.
#[async_trait::async_trait]
pub trait PoolBackend: Send + Sync + 'static {
    type Pool: ConnectionPool;

    async fn open(
        &self,
        connection_string: &str,
        options: &PoolOptions,
    ) -> Result<Self::Pool, BackendError>;
}

/// A live pool of connections.
#[async_trait::async_trait]
pub trait ConnectionPool: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Borrow one connection.
    async fn acquire(&self) -> Result<Self::Connection, BackendError>;

    /// Return a borrowed connection. Must not block.
    fn release(&self, conn: Self::Connection);

    /// Round-trip to the server on a borrowed connection.
    async fn ping(&self, conn: &mut Self::Connection) -> Result<(), BackendError>;

    /// Gracefully close every pooled connection.
    async fn close(&self) -> Result<(), BackendError>;

    /// Connections currently open, idle or borrowed.
    fn size(&self) -> u32;

    /// Connections currently idle in the pool.
    fn idle(&self) -> usize;
}
