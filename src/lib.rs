pub mod appresult;
pub mod auth;
pub mod config;
pub mod db;
pub mod protocol;
pub mod reducer;
pub mod rooms;
pub mod session;

use std::sync::Arc;

use axum::{extract::FromRef, http::{header, HeaderValue, Method}, routing::get, Router};
use sqlx::SqlitePool;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tower_sessions::{cookie::SameSite, Expiry, MemoryStore, SessionManagerLayer};

pub use appresult::{AppError, AppResult, SyncError};
pub use config::Config;
use rooms::registry::Registry;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub registry: Registry,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(db_pool: SqlitePool, config: Config) -> Self {
        AppState {
            db_pool,
            registry: Registry::with_capacity(config.outbound_queue),
            config: Arc::new(config),
        }
    }
}

pub fn app(app_state: AppState) -> anyhow::Result<Router> {
    let session_layer = SessionManagerLayer::new(MemoryStore::default())
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(time::Duration::minutes(
            app_state.config.session_idle_minutes,
        )));

    let cors = match &app_state.config.client_url {
        Some(origin) => CorsLayer::new()
            .allow_origin(origin.parse::<HeaderValue>()?)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers([header::CONTENT_TYPE])
            .allow_credentials(true),
        None => CorsLayer::permissive(),
    };

    Ok(Router::new()
        .route("/ws", get(rooms::gateway))
        .merge(auth::router())
        .nest("/rooms", rooms::router())
        .with_state(app_state)
        .layer(session_layer)
        .layer(cors)
        .layer(TraceLayer::new_for_http()))
}
