use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::db::DbPingError;
use crate::state::AppState;

const PING_TIMEOUT: Duration = Duration::from_secs(2);

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(root))
        .route("/info", get(info))
        .route("/live", get(live))
        .route("/ready", get(ready))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    database: &'static str,
    timestamp: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InfoResponse {
    service: &'static str,
    version: &'static str,
    environment: String,
    start_time: String,
    uptime: u64,
}

#[derive(Serialize)]
struct LivenessResponse {
    status: &'static str,
    timestamp: String,
    uptime: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadinessResponse {
    status: &'static str,
    timestamp: String,
    uptime: u64,
    database: &'static str,
    database_latency_ms: Option<u64>,
    cache: &'static str,
}

enum DbCheck {
    Connected { latency_ms: u64 },
    Timeout,
    Disconnected,
}

async fn root(State(state): State<AppState>) -> Response {
    let ok = matches!(database_check(&state).await, DbCheck::Connected { .. });
    let body = HealthResponse {
        status: if ok { "ok" } else { "degraded" },
        database: if ok { "connected" } else { "disconnected" },
        timestamp: now_iso(),
    };
    let status = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

async fn info(State(state): State<AppState>) -> Response {
    let started: chrono::DateTime<chrono::Utc> = state.started_at_system().into();
    Json(InfoResponse {
        service: "lms-backend",
        version: env!("CARGO_PKG_VERSION"),
        environment: std::env::var("APP_ENV")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "development".to_string()),
        start_time: started.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        uptime: state.uptime_seconds(),
    })
    .into_response()
}

async fn live(State(state): State<AppState>) -> Response {
    Json(LivenessResponse {
        status: "healthy",
        timestamp: now_iso(),
        uptime: state.uptime_seconds(),
    })
    .into_response()
}

async fn ready(State(state): State<AppState>) -> Response {
    let (database, latency) = match database_check(&state).await {
        DbCheck::Connected { latency_ms } => ("connected", Some(latency_ms)),
        DbCheck::Timeout => ("timeout", None),
        DbCheck::Disconnected => ("disconnected", None),
    };
    let cache = match state.cache() {
        Some(cache) if cache.is_connected().await => "connected",
        Some(_) => "disconnected",
        None => "disabled",
    };

    let status = match database {
        "connected" if cache != "disconnected" => "healthy",
        "connected" | "timeout" => "degraded",
        _ => "unhealthy",
    };
    let code = if status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        code,
        Json(ReadinessResponse {
            status,
            timestamp: now_iso(),
            uptime: state.uptime_seconds(),
            database,
            database_latency_ms: latency,
            cache,
        }),
    )
        .into_response()
}

async fn database_check(state: &AppState) -> DbCheck {
    let Some(proxy) = state.db_proxy() else {
        return DbCheck::Disconnected;
    };
    match proxy.ping(PING_TIMEOUT).await {
        Ok(elapsed) => DbCheck::Connected {
            latency_ms: elapsed.as_millis() as u64,
        },
        Err(DbPingError::Timeout) => DbCheck::Timeout,
        Err(err) => {
            tracing::warn!(error = %err, "database health check failed");
            DbCheck::Disconnected
        }
    }
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
