pub mod access;
pub mod auth;
pub mod cache;
pub mod config;
pub mod db;
pub mod logging;
pub mod middleware;
pub mod response;
pub mod routes;
pub mod seed;
pub mod services;
pub mod state;
pub mod workers;

use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::Config;
use crate::state::AppState;

/// The full HTTP application for an already assembled state.
pub fn build_app(state: AppState) -> axum::Router {
    let cors = cors_layer(state.config().cors_origin.as_deref());
    routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Connects the database from `config` and builds the application without a cache.
/// A database that fails to open leaves the service up, answering 503.
pub async fn create_app(config: Config) -> axum::Router {
    let db_proxy = match db::DatabaseProxy::from_config(&config).await {
        Ok(proxy) => Some(Arc::new(proxy)),
        Err(err) => {
            tracing::warn!(error = %err, "database proxy not initialized");
            None
        }
    };
    build_app(AppState::new(config, db_proxy, None))
}

fn cors_layer(origin: Option<&str>) -> CorsLayer {
    let Some(origin) = origin.and_then(|o| HeaderValue::from_str(o).ok()) else {
        return CorsLayer::permissive();
    };
    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true)
}
