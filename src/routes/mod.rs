mod analytics;
mod assessments;
mod auth;
mod departments;
mod groups;
mod health;
mod modules;
mod notices;
mod questions;
mod users;

use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde::{Deserialize, Deserializer};

use crate::middleware::auth::require_auth;
use crate::middleware::rate_limit::{api_rate_limit_middleware, auth_rate_limit_middleware};
use crate::response::json_error;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .nest("/users", users::router())
        .nest("/departments", departments::router())
        .nest("/groups", groups::router())
        .nest("/modules", modules::router())
        .nest("/questions", questions::router())
        .nest("/assessments", assessments::router())
        .nest("/notices", notices::router())
        .nest("/analytics", analytics::router())
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let auth_routes = auth::public_router().merge(
        auth::protected_router()
            .route_layer(middleware::from_fn_with_state(state.clone(), require_auth)),
    );

    Router::new()
        .nest("/api/auth", auth_routes)
        .nest("/api", protected)
        .nest("/health", health::router())
        .layer(middleware::from_fn(auth_rate_limit_middleware))
        .layer(middleware::from_fn(api_rate_limit_middleware))
        .fallback(fallback_handler)
        .with_state(state)
}

async fn fallback_handler() -> Response {
    json_error(StatusCode::NOT_FOUND, "NOT_FOUND", "Route not found").into_response()
}

/// Distinguishes an absent JSON field (`None`) from an explicit `null` (`Some(None)`).
pub(crate) fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

pub(crate) fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
