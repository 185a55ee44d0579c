use axum::{routing::get, Router};

use crate::infrastructure::postgres::PoolBackend;
use crate::server::AppState;

use super::health::{db_health, health};

pub fn api_routes<B: PoolBackend>() -> Router<AppState<B>> {
    Router::new()
        .route("/health", get(health::<B>))
        .route("/health/db", get(db_health::<B>))
}
