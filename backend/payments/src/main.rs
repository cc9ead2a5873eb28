//! Payments service entry point.
//!
//! Exposes the payment capture surface (gateway orders, checkout
//! confirmations, signed webhooks, manual proof review, receipts) over an
//! Axum REST API backed by SQLite, and runs a background task that audits
//! pledged totals against the contribution ledger.

mod api;
mod config;
mod confirm;
mod db;
mod errors;
mod events;
mod gateway;
mod ledger;
mod manual;
mod notify;
mod orders;
mod receipts;
mod reconciler;
mod signature;
mod storage;
mod types;
mod webhook;

#[cfg(test)]
mod testutil;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use api::AppState;
use config::Config;
use gateway::HttpGateway;
use notify::HttpMailer;
use storage::LocalBlobStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;
    if config.gateway_key_secret.is_none() {
        warn!("GATEWAY_KEY_SECRET is not set; orders and checkout confirmations will fail");
    }
    if config.webhook_secret.is_none() {
        warn!("GATEWAY_WEBHOOK_SECRET is not set; webhooks will be refused");
    }

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    // HTTP client shared by the gateway and mail clients.
    let client = HttpGateway::build_client(&config)?;

    let state = Arc::new(AppState {
        pool: pool.clone(),
        gateway: Arc::new(HttpGateway::new(client.clone(), &config)),
        blobs: Arc::new(LocalBlobStore::new(&config.blob_dir, &config.blob_public_url)),
        mailer: Arc::new(HttpMailer::new(client, &config)),
        config: config.clone(),
    });

    let shutdown = CancellationToken::new();

    // ─── Background reconciler ────────────────────────────
    let reconciler = if config.reconcile_interval_secs > 0 {
        Some(tokio::spawn(reconciler::run(
            pool,
            Duration::from_secs(config.reconcile_interval_secs),
            shutdown.clone(),
        )))
    } else {
        None
    };

    // ─── REST API ─────────────────────────────────────────
    let app = api::router(state)
        .nest_service("/blobs", ServeDir::new(&config.blob_dir))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
            token.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Some(handle) = reconciler {
        let _ = handle.await;
    }
    Ok(())
}
