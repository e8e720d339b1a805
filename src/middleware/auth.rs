use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::auth::AuthError;
use crate::response::json_error;
use crate::state::AppState;

/// Resolves the caller from the bearer token or auth cookie and stores the
/// [`AuthUser`](crate::auth::AuthUser) in the request extensions.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let Some(token) = crate::auth::extract_token(req.headers()) else {
        return json_error(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "Authentication token missing")
            .into_response();
    };

    let Some(proxy) = state.db_proxy() else {
        return json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_UNAVAILABLE",
            "Database service unavailable",
        )
        .into_response();
    };

    let cache = state.cache();
    match crate::auth::verify_request_token(proxy.as_ref(), &token, cache.as_deref()).await {
        Ok(user) => {
            req.extensions_mut().insert(user);
            next.run(req).await
        }
        Err(AuthError::Inactive) => {
            json_error(StatusCode::FORBIDDEN, "ACCOUNT_DISABLED", "Account is disabled").into_response()
        }
        Err(AuthError::Database(err)) => {
            tracing::error!(error = %err, "session lookup failed");
            json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                "Database service unavailable",
            )
            .into_response()
        }
        Err(err) => {
            tracing::debug!(error = %err, "rejected token");
            json_error(
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Authentication failed, please sign in again",
            )
            .into_response()
        }
    }
}
