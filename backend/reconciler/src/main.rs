//! Campaign reconciler — entry point.
//!
//! Starts a background sweep that re-reconciles every deployed campaign
//! against authoritative escrow-contract state and backfills missed
//! pledges. Simultaneously exposes the Axum REST API the frontend drives
//! campaign creation, pledge confirmation, finalization, and refunds
//! through.

mod amount;
mod api;
mod config;
mod db;
mod errors;
mod escrow;
mod finalize;
mod models;
mod pledge;
mod reconcile;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use escrow::EscrowClient;
use reconcile::SweepState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    // Load config from environment.
    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    // HTTP client shared by all outbound escrow-node calls.
    let client = Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let gateway = EscrowClient::new(client, &config);

    // ─── Background reconciliation sweep ──────────────────
    let cancel = CancellationToken::new();
    let sweep_state = Arc::new(SweepState {
        pool: pool.clone(),
        gateway: gateway.clone(),
        interval: Duration::from_secs(config.sweep_interval_secs),
    });
    tokio::spawn(reconcile::run(sweep_state, cancel.clone()));

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(api::ApiState { pool, gateway });

    let app = Router::new()
        .route("/health", get(api::health))
        .route(
            "/campaigns",
            get(api::list_campaigns).post(api::create_campaign),
        )
        .route("/campaigns/:id", get(api::get_campaign))
        .route("/campaigns/:id/blockchain", post(api::update_blockchain))
        .route(
            "/campaigns/:id/pledges",
            get(api::pledges_for_campaign).post(api::confirm_pledge),
        )
        .route("/campaigns/:id/pledge", post(api::intake_pledge))
        .route("/campaigns/:id/finalize", post(api::finalize_campaign))
        .route("/campaigns/:id/refund", post(api::claim_refund))
        .route("/campaigns/:id/reconcile", post(api::reconcile_campaign))
        .route("/creators/:address/campaigns", get(api::campaigns_by_creator))
        .route("/backers/:address/campaigns", get(api::campaigns_by_backer))
        .route("/backers/:address/pledges", get(api::pledges_by_backer))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(api_state);

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown(cancel))
        .await?;

    Ok(())
}

/// Ctrl-C stops the HTTP server and cancels the sweep.
async fn shutdown(cancel: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown requested");
    cancel.cancel();
}
