//! Logging capability handed to the pool manager.

/// Where the pool manager reports lifecycle events.
pub trait PoolEvents: Send + Sync {
    fn info(&self, message: &str);
    fn error(&self, message: &str);
}

/// Forwards events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEvents;

impl PoolEvents for TracingEvents {
    fn info(&self, message: &str) {
        tracing::info!(target: "pg_pool_manager::pool", "{}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "pg_pool_manager::pool", "{}", message);
    }
}
