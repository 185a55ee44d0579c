//! Health check endpoints.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::error::ServiceError;
use crate::infrastructure::postgres::{ConnectionPool, PoolBackend, PoolStatus};
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub max_connections: u32,
    pub identity_auth: bool,
    pub pool: PoolStatus,
}

#[derive(Debug, Serialize)]
pub struct DbHealthResponse {
    pub status: String,
    pub pool: PoolStatus,
}

/// Liveness. Never touches the database.
pub async fn health<B: PoolBackend>(State(state): State<AppState<B>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: state.settings.otel.service_name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        max_connections: state.settings.database.max_connections,
        identity_auth: state.db.config().uses_identity_auth(),
        pool: state.db.status().await,
    })
}

/// Readiness. Borrows a connection and pings the server.
pub async fn db_health<B: PoolBackend>(
    State(state): State<AppState<B>>,
) -> Result<Json<DbHealthResponse>, ServiceError> {
    let pool = {
        let mut conn = state.db.enter().await?;
        let borrowed_from = conn.pool().clone();
        borrowed_from
            .ping(&mut *conn)
            .await
            .map_err(|e| ServiceError::unavailable(format!("Postgres error: {}", e)))?;
        conn.exit();
        state.db.status().await
    };

    Ok(Json(DbHealthResponse {
        status: "connected".to_string(),
        pool,
    }))
}
