//! API layer - HTTP endpoint handlers.

mod health;
mod routes;

pub use health::{db_health, health, DbHealthResponse, HealthResponse};
pub use routes::api_routes;
