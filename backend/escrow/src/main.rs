//! Campaign escrow service: entry point.
//!
//! Starts the lifecycle worker that settles campaigns past their deadline
//! and exposes the escrow REST API beside it. Both share one SQLite pool.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use escrow::api::{self, ApiState};
use escrow::config::{Config, LogFormat};
use escrow::db;
use escrow::lifecycle::LifecycleWorker;
use escrow::service::EscrowService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;
    init_tracing(config.log_format);

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url, config.db_max_connections).await?;

    let shutdown = CancellationToken::new();

    // ─── Background lifecycle worker ──────────────────────
    let worker_handle = if config.lifecycle_enabled {
        let worker = LifecycleWorker::new(pool.clone(), config.lifecycle());
        let token = shutdown.clone();
        Some(tokio::spawn(async move { worker.run(token).await }))
    } else {
        info!("Lifecycle worker disabled");
        None
    };

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(ApiState {
        service: EscrowService::new(pool.clone()),
    });
    let app = api::router(api_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            token.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Some(handle) = worker_handle {
        handle.await?;
    }
    pool.close().await;
    Ok(())
}

fn init_tracing(format: LogFormat) {
    // RUST_LOG controls verbosity.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}
