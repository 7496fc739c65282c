mod auth;
mod card_cache;
mod chat;
mod config;
mod middleware;
mod notify;
mod pthn;
mod rate_limit;
mod thai_id;
mod totp;

mod db;
mod error;
mod models;
mod routes;

use std::sync::Arc;

use crate::{config::Config, models::AppState};

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use axum::http::header;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = Config::from_env()?;
    let pool = db::connect_pg(&cfg.database_url).await?;

    let notifier = Arc::new(notify::Notifier::from_config(&cfg)?);

    let state = AppState {
        db: pool,
        session_ttl_hours: cfg.session_ttl_hours,
        initial_assessment_clinic: cfg.initial_assessment_clinic.clone(),
        google_oauth: cfg.google_oauth.clone(),
        login_limiter: Arc::new(rate_limit::LoginRateLimiter::new()),
        card_cache: Arc::new(card_cache::CardCache::new()),
        chat: Arc::new(chat::ChatRegistry::new()),
        notifier,
    };

    // Browser clients (clinic front desk tablets) call the API cross-origin.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]);

    let app = routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!("Listening on http://{}", cfg.bind_addr);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
