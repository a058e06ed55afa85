mod api;
mod app;
mod auth;
mod config;
mod db;
mod domain;
mod error;
mod logging;
mod middleware;
mod routes;
mod services;
mod store;

#[cfg(test)]
mod test_support;

use anyhow::{Context, Result};
use std::sync::Arc;

use services::{BudgetService, HttpEscrowClient, MilestoneService};
use store::PgStore;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let settings = config::Settings::from_env()?;

    logging::init_logging(&settings.env);

    tracing::info!(
        env = ?settings.env,
        server_addr = %settings.server_addr,
        "Starting Mercado Oficio backend"
    );

    let pool = db::create_pool(&settings).await?;
    if settings.run_migrations {
        db::run_migrations(&pool).await?;
    }

    // One client for every outbound call (JWKS, escrow provider)
    let http_client = reqwest::Client::builder()
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .build()
        .context("Failed to create HTTP client")?;

    let escrow = Arc::new(HttpEscrowClient::new(
        http_client.clone(),
        settings.escrow_service_url.clone(),
        &settings.escrow_service_token,
        settings.escrow_timeout_seconds,
        settings.escrow_max_retry_seconds,
    )?);

    let store = Arc::new(PgStore::new(pool.clone()));
    let budgets = BudgetService::new(
        store.clone(),
        store.clone(),
        escrow.clone(),
        settings.policy.clone(),
    );
    let milestones = MilestoneService::new(store, escrow);

    let jwks_cache = auth::JwksCache::new(
        http_client,
        settings.jwt_jwks_url.clone(),
        settings.jwt_issuer.clone(),
        settings.jwt_audience.clone(),
        settings.jwks_cache_ttl_seconds,
    );

    if let Err(e) = jwks_cache.warm_cache().await {
        tracing::warn!(error = %e, "Failed to warm JWKS cache - will fetch on first request");
    }

    let state = app::AppState::new(pool, settings.clone(), jwks_cache, budgets, milestones);
    let app = app::create_app(state);

    let listener = tokio::net::TcpListener::bind(&settings.server_addr).await?;
    tracing::info!("Listening on {}", settings.server_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
