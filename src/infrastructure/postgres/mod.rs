//! PostgreSQL connection pooling.
//!
//! `backend` defines the pool boundary, `pool` implements it with sqlx and
//! `manager` owns the pool lifecycle and scoped acquisition.

mod backend;
mod events;
mod manager;
pub mod pool;

pub use backend::{BackendError, ConnectionPool, PoolBackend, PoolOptions};
pub use events::{PoolEvents, TracingEvents};
pub use manager::{
    ConnectionGuard, PoolManager, PoolStatus, GENERAL_ACQUIRE_ERROR, RETRIES_EXCEEDED,
};
pub use pool::{PostgresPool, SqlxBackend};
