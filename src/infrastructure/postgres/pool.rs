//! sqlx-backed PostgreSQL pool.

use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Connection, Postgres};

use super::backend::{BackendError, ConnectionPool, PoolBackend, PoolOptions};

/// Map sqlx errors onto the pool-level / unexpected split.
pub fn classify(err: sqlx::Error) -> BackendError {
    match err {
        sqlx::Error::Database(_)
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => BackendError::Pool(err.to_string()),
        other => BackendError::Unexpected(other.to_string()),
    }
}

/// Opens [`PostgresPool`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlxBackend;

#[async_trait::async_trait]
impl PoolBackend for SqlxBackend {
    type Pool = PostgresPool;

    async fn open(
        &self,
        connection_string: &str,
        options: &PoolOptions,
    ) -> Result<PostgresPool, BackendError> {
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(options.acquire_timeout)
            .idle_timeout(options.idle_timeout)
            .connect(connection_string)
            .await
            .map_err(classify)?;

        tracing::info!(
            max_connections = options.max_connections,
            idle_timeout_seconds = options.idle_timeout.as_secs(),
            "PostgreSQL connection pool created"
        );

        Ok(PostgresPool { pool })
    }
}

/// PostgreSQL connection pool.
#[derive(Clone)]
pub struct PostgresPool {
    pool: PgPool,
}

#[async_trait::async_trait]
impl ConnectionPool for PostgresPool {
    type Connection = PoolConnection<Postgres>;

    async fn acquire(&self) -> Result<Self::Connection, BackendError> {
        self.pool.acquire().await.map_err(classify)
    }

    fn release(&self, conn: Self::Connection) {
        // Dropping a PoolConnection hands it back to its pool
        drop(conn);
    }

    async fn ping(&self, conn: &mut Self::Connection) -> Result<(), BackendError> {
        conn.ping().await.map_err(classify)
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.pool.close().await;
        tracing::info!("PostgreSQL connection pool closed");
        Ok(())
    }

    fn size(&self) -> u32 {
        self.pool.size()
    }

    fn idle(&self) -> usize {
        self.pool.num_idle()
    }
}
