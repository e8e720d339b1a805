use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header::RETRY_AFTER, HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tokio::sync::Mutex;

use crate::config::env_bool;
use crate::response::json_error;

const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");

const DEFAULT_API_WINDOW_MS: u64 = 15 * 60 * 1000;
const DEFAULT_API_MAX: u64 = 500;

const AUTH_WINDOW_MS: u64 = 5 * 60 * 1000;
const AUTH_MAX: u64 = 30;

static API_LIMITER: OnceLock<Arc<RateLimiter>> = OnceLock::new();
static AUTH_LIMITER: OnceLock<Arc<RateLimiter>> = OnceLock::new();

pub async fn api_rate_limit_middleware(req: Request<Body>, next: Next) -> Response {
    let path = req.uri().path();
    if !(path == "/api" || path.starts_with("/api/")) || is_exempt(&req) {
        return next.run(req).await;
    }

    let limiter = API_LIMITER.get_or_init(|| {
        Arc::new(RateLimiter::new(RateLimitConfig {
            window_ms: env_u64("RATE_LIMIT_WINDOW_MS").unwrap_or(DEFAULT_API_WINDOW_MS),
            max: env_u64("RATE_LIMIT_MAX").unwrap_or(DEFAULT_API_MAX),
        }))
    });
    enforce(limiter, Scope::Api, req, next, "TOO_MANY_REQUESTS", "Too many requests, please try again later").await
}

pub async fn auth_rate_limit_middleware(req: Request<Body>, next: Next) -> Response {
    if !req.uri().path().starts_with("/api/auth") || is_exempt(&req) {
        return next.run(req).await;
    }

    let limiter = AUTH_LIMITER.get_or_init(|| {
        Arc::new(RateLimiter::new(RateLimitConfig {
            window_ms: AUTH_WINDOW_MS,
            max: AUTH_MAX,
        }))
    });
    enforce(
        limiter,
        Scope::Auth,
        req,
        next,
        "TOO_MANY_AUTH_REQUESTS",
        "Too many authentication attempts, please try again later",
    )
    .await
}

async fn enforce(
    limiter: &RateLimiter,
    scope: Scope,
    req: Request<Body>,
    next: Next,
    code: &'static str,
    message: &'static str,
) -> Response {
    let ip = client_ip(&req).unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let check = limiter.check(Key { scope, ip }, crate::db::now_ms().max(0) as u64).await;

    if !check.allowed {
        tracing::warn!(%ip, ?scope, "rate limit exceeded");
        let mut res = json_error(StatusCode::TOO_MANY_REQUESTS, code, message).into_response();
        apply_headers(&mut res, check);
        return res;
    }

    let mut res = next.run(req).await;
    apply_headers(&mut res, check);
    res
}

fn apply_headers(res: &mut Response, check: RateLimitCheck) {
    let headers = res.headers_mut();
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(check.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(check.remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(check.reset_after_seconds));
    if !check.allowed {
        headers.insert(RETRY_AFTER, HeaderValue::from(check.reset_after_seconds));
    }
}

fn is_exempt(req: &Request<Body>) -> bool {
    matches!(std::env::var("APP_ENV").ok().as_deref(), Some("test"))
        || client_ip(req).map_or(false, |ip| ip.is_loopback())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn client_ip(req: &Request<Body>) -> Option<IpAddr> {
    if env_bool("TRUST_PROXY").unwrap_or(false) {
        let forwarded = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|raw| raw.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if forwarded.is_some() {
            return forwarded;
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Scope {
    Api,
    Auth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Key {
    scope: Scope,
    ip: IpAddr,
}

#[derive(Debug, Clone, Copy)]
struct RateLimitConfig {
    window_ms: u64,
    max: u64,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_ms: u64,
    hits: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RateLimitCheck {
    allowed: bool,
    limit: u64,
    remaining: u64,
    reset_after_seconds: u64,
}

/// Fixed-window counter per client key. Stale windows are swept once per window length.
#[derive(Debug)]
struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<(HashMap<Key, Window>, u64)>,
}

impl RateLimiter {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new((HashMap::new(), 0)),
        }
    }

    async fn check(&self, key: Key, now_ms: u64) -> RateLimitCheck {
        let window_ms = self.config.window_ms;
        let mut guard = self.windows.lock().await;
        let (windows, last_sweep) = &mut *guard;

        if now_ms.saturating_sub(*last_sweep) >= window_ms {
            windows.retain(|_, w| now_ms.saturating_sub(w.started_ms) < window_ms);
            *last_sweep = now_ms;
        }

        let window = windows.entry(key).or_insert(Window {
            started_ms: now_ms,
            hits: 0,
        });
        if now_ms.saturating_sub(window.started_ms) >= window_ms {
            *window = Window {
                started_ms: now_ms,
                hits: 0,
            };
        }

        window.hits = window.hits.saturating_add(1);
        let allowed = window.hits <= self.config.max;
        let reset_after_ms = window_ms.saturating_sub(now_ms.saturating_sub(window.started_ms));

        RateLimitCheck {
            allowed,
            limit: self.config.max,
            remaining: self.config.max.saturating_sub(window.hits),
            reset_after_seconds: reset_after_ms.div_ceil(1000),
        }
    }
}
