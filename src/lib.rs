// Infrastructure layer (shared components)
pub mod infrastructure;

pub use infrastructure::identity;
pub use infrastructure::postgres;

pub mod config;
pub mod error;

// Application layer
pub mod api;
pub mod server;

// Supporting modules
pub mod telemetry;
