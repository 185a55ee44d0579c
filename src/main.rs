use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;

use pg_pool_manager::config::{DbConfig, Settings};
use pg_pool_manager::identity::DefaultCredential;
use pg_pool_manager::postgres::{PoolManager, SqlxBackend};
use pg_pool_manager::server::{create_app, AppState};
use pg_pool_manager::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::new()?;
    let _telemetry = init_telemetry(&settings.otel)?;
    tracing::info!("Configuration loaded");

    let credential = Arc::new(DefaultCredential::from_settings(&settings.identity)?);
    let db_config = Arc::new(DbConfig::new(settings.database.clone(), credential)?);
    tracing::info!(
        identity_auth = db_config.uses_identity_auth(),
        "Database configuration validated"
    );

    let db = Arc::new(PoolManager::from_settings(
        db_config,
        SqlxBackend,
        &settings.database,
    ));

    // Warm the pool; a failure here is not fatal, the first request retries
    if let Err(e) = db.create_pool().await {
        tracing::warn!(error = %e, "Initial pool creation failed");
    }

    let state = AppState::new(settings.clone(), db.clone());
    let app = create_app(state);

    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if db.is_open().await {
        if let Err(e) = db.close_pool().await {
            tracing::error!(error = %e, "Failed to close connection pool");
        }
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
