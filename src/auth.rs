use axum::http::{header, HeaderMap, HeaderValue};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::Row;
use thiserror::Error;
use uuid::Uuid;

use crate::access::Role;
use crate::cache::keys::{session_key, SESSION_TTL};
use crate::cache::RedisCache;
use crate::db::DatabaseProxy;
use crate::response::AppError;

pub const AUTH_COOKIE_NAME: &str = "auth_token";
const BCRYPT_COST: u32 = 10;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub id: String,
    pub email: String,
    pub username: String,
    pub role: Role,
    pub department_id: Option<String>,
    pub group_id: Option<String>,
    pub is_active: bool,
    #[serde(default, skip_serializing)]
    pub created_at: i64,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("invalid token")]
    InvalidToken,
    #[error("account disabled")]
    Inactive,
    #[error("missing JWT_SECRET")]
    MissingSecret,
    #[error("invalid JWT_EXPIRES_IN")]
    InvalidExpiresIn,
    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingToken | AuthError::InvalidToken => {
                AppError::unauthorized("Authentication failed, please sign in again")
            }
            AuthError::Inactive => AppError::forbidden("Account is disabled").with_code("ACCOUNT_DISABLED"),
            AuthError::Database(err) => err.into(),
            other => {
                tracing::error!(error = %other, "auth configuration error");
                AppError::internal(other.to_string())
            }
        }
    }
}

pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = get_cookie(headers, AUTH_COOKIE_NAME) {
        return Some(token);
    }

    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())?;

    auth_header
        .strip_prefix("Bearer ")
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Verifies signature and claims, then the server-side session and the user row.
/// A cached session skips the database round-trip.
pub async fn verify_request_token(
    proxy: &DatabaseProxy,
    token: &str,
    cache: Option<&RedisCache>,
) -> Result<AuthUser, AuthError> {
    let secret = jwt_secret()?;
    let claims = verify_jwt_hs256(token, &secret)?;
    let token_hash = hash_token(token);

    if let Some(cache) = cache {
        if let Some(user) = cache.get::<AuthUser>(&session_key(&token_hash)).await {
            if user.id == claims.user_id {
                return Ok(user);
            }
        }
    }

    let session_row = sqlx::query(r#"SELECT "userId", "expiresAt" FROM "sessions" WHERE "token" = ?"#)
        .bind(&token_hash)
        .fetch_optional(proxy.pool())
        .await?;

    let Some(session_row) = session_row else {
        return Err(AuthError::InvalidToken);
    };

    let session_user_id: String = session_row.try_get("userId")?;
    let session_expires_at: i64 = session_row.try_get("expiresAt")?;

    if session_user_id != claims.user_id || session_expires_at < crate::db::now_ms() {
        return Err(AuthError::InvalidToken);
    }

    let user = crate::db::operations::users::find_auth_user(proxy, &claims.user_id)
        .await?
        .ok_or(AuthError::InvalidToken)?;

    if !user.is_active {
        return Err(AuthError::Inactive);
    }

    if let Some(cache) = cache {
        cache.set(&session_key(&token_hash), &user, SESSION_TTL).await;
    }

    Ok(user)
}

/// Signs a token for `user_id` and records its session. Returns the token and its expiry (ms).
pub async fn issue_session(proxy: &DatabaseProxy, user_id: &str) -> Result<(String, i64), AuthError> {
    let (token, expires_at) = sign_jwt_for_user(user_id)?;
    sqlx::query(
        r#"
        INSERT INTO "sessions" ("id", "userId", "token", "expiresAt", "createdAt")
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(user_id)
    .bind(hash_token(&token))
    .bind(expires_at)
    .bind(crate::db::now_ms())
    .execute(proxy.pool())
    .await?;
    Ok((token, expires_at))
}

/// Drops every session of the user except the one identified by `keep_token_hash`,
/// including cached copies.
pub async fn revoke_user_sessions(
    proxy: &DatabaseProxy,
    cache: Option<&RedisCache>,
    user_id: &str,
    keep_token_hash: Option<&str>,
) -> Result<u64, sqlx::Error> {
    let keep = keep_token_hash.unwrap_or("");

    if let Some(cache) = cache {
        let hashes: Vec<(String,)> =
            sqlx::query_as(r#"SELECT "token" FROM "sessions" WHERE "userId" = ? AND "token" != ?"#)
                .bind(user_id)
                .bind(keep)
                .fetch_all(proxy.pool())
                .await?;
        for (hash,) in hashes {
            cache.delete(&session_key(&hash)).await;
        }
    }

    let result = sqlx::query(r#"DELETE FROM "sessions" WHERE "userId" = ? AND "token" != ?"#)
        .bind(user_id)
        .bind(keep)
        .execute(proxy.pool())
        .await?;
    Ok(result.rows_affected())
}

pub fn hash_password(password: &str) -> Result<String, AuthError> {
    Ok(bcrypt::hash(password, BCRYPT_COST)?)
}

pub fn verify_password(password: &str, password_hash: &str) -> bool {
    bcrypt::verify(password, password_hash).unwrap_or(false)
}

#[derive(Debug, Clone)]
struct JwtClaims {
    user_id: String,
}

fn jwt_secret() -> Result<String, AuthError> {
    std::env::var("JWT_SECRET")
        .ok()
        .filter(|value| !value.is_empty())
        .ok_or(AuthError::MissingSecret)
}

fn verify_jwt_hs256(token: &str, secret: &str) -> Result<JwtClaims, AuthError> {
    let mut parts = token.split('.');
    let header_b64 = parts.next().ok_or(AuthError::InvalidToken)?;
    let payload_b64 = parts.next().ok_or(AuthError::InvalidToken)?;
    let sig_b64 = parts.next().ok_or(AuthError::InvalidToken)?;
    if parts.next().is_some() {
        return Err(AuthError::InvalidToken);
    }

    let header_bytes = URL_SAFE_NO_PAD
        .decode(header_b64.as_bytes())
        .map_err(|_| AuthError::InvalidToken)?;
    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload_b64.as_bytes())
        .map_err(|_| AuthError::InvalidToken)?;
    let sig_bytes = URL_SAFE_NO_PAD
        .decode(sig_b64.as_bytes())
        .map_err(|_| AuthError::InvalidToken)?;

    let header_json: serde_json::Value =
        serde_json::from_slice(&header_bytes).map_err(|_| AuthError::InvalidToken)?;
    if header_json.get("alg").and_then(|value| value.as_str()) != Some("HS256") {
        return Err(AuthError::InvalidToken);
    }

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::InvalidToken)?;
    mac.update(format!("{header_b64}.{payload_b64}").as_bytes());
    mac.verify_slice(&sig_bytes)
        .map_err(|_| AuthError::InvalidToken)?;

    let payload_json: serde_json::Value =
        serde_json::from_slice(&payload_bytes).map_err(|_| AuthError::InvalidToken)?;

    validate_registered_claims(&payload_json)?;

    let user_id = payload_json
        .get("userId")
        .and_then(|value| value.as_str())
        .ok_or(AuthError::InvalidToken)?
        .to_string();

    Ok(JwtClaims { user_id })
}

fn validate_registered_claims(payload: &serde_json::Value) -> Result<(), AuthError> {
    let now = Utc::now().timestamp();

    if let Some(exp) = payload.get("exp").and_then(|value| value.as_i64()) {
        if now >= exp {
            return Err(AuthError::InvalidToken);
        }
    }

    if let Some(nbf) = payload.get("nbf").and_then(|value| value.as_i64()) {
        if now < nbf {
            return Err(AuthError::InvalidToken);
        }
    }

    Ok(())
}

pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Returns the token and its expiry in epoch milliseconds.
pub fn sign_jwt_for_user(user_id: &str) -> Result<(String, i64), AuthError> {
    let secret = jwt_secret()?;
    let expires_in = std::env::var("JWT_EXPIRES_IN").unwrap_or_else(|_| "24h".to_string());
    let expires_in_ms = parse_expires_in_ms(&expires_in)?;
    sign_jwt(user_id, &secret, expires_in_ms)
}

fn sign_jwt(user_id: &str, secret: &str, expires_in_ms: i64) -> Result<(String, i64), AuthError> {
    let issued_at = Utc::now();
    let exp = issued_at
        .checked_add_signed(chrono::Duration::milliseconds(expires_in_ms))
        .ok_or(AuthError::InvalidExpiresIn)?;

    let header_json = serde_json::json!({
        "alg": "HS256",
        "typ": "JWT",
    });

    // jti keeps two tokens issued in the same second distinct.
    let payload_json = serde_json::json!({
        "userId": user_id,
        "iat": issued_at.timestamp(),
        "exp": exp.timestamp(),
        "jti": Uuid::new_v4().to_string(),
    });

    let header_b64 = URL_SAFE_NO_PAD
        .encode(serde_json::to_vec(&header_json).map_err(|_| AuthError::InvalidToken)?);
    let payload_b64 = URL_SAFE_NO_PAD
        .encode(serde_json::to_vec(&payload_json).map_err(|_| AuthError::InvalidToken)?);
    let signing_input = format!("{header_b64}.{payload_b64}");

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::InvalidToken)?;
    mac.update(signing_input.as_bytes());
    let sig_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok((format!("{signing_input}.{sig_b64}"), exp.timestamp_millis()))
}

pub fn parse_expires_in_ms(value: &str) -> Result<i64, AuthError> {
    let trimmed = value.trim();
    if trimmed.len() < 2 {
        return Err(AuthError::InvalidExpiresIn);
    }

    let (digits, unit) = trimmed.split_at(trimmed.len() - 1);
    let amount: i64 = digits.parse().map_err(|_| AuthError::InvalidExpiresIn)?;
    if amount <= 0 {
        return Err(AuthError::InvalidExpiresIn);
    }

    match unit {
        "s" => Ok(amount * 1000),
        "m" => Ok(amount * 60 * 1000),
        "h" => Ok(amount * 60 * 60 * 1000),
        "d" => Ok(amount * 24 * 60 * 60 * 1000),
        _ => Err(AuthError::InvalidExpiresIn),
    }
}

pub fn auth_cookie_header(token: &str, max_age_secs: i64) -> Option<HeaderValue> {
    let secure = std::env::var("APP_ENV").map(|env| env == "production").unwrap_or(false);
    let mut cookie = format!(
        "{AUTH_COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        max_age_secs.max(0)
    );
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie).ok()
}

pub fn clear_auth_cookie_header() -> Option<HeaderValue> {
    HeaderValue::from_str(&format!(
        "{AUTH_COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0"
    ))
    .ok()
}

fn get_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|part| {
        let (key, value) = part.trim().split_once('=')?;
        (key == name && !value.is_empty()).then(|| value.to_string())
    })
}

/// Lower-cased address when it looks like `local@domain.tld`.
pub fn normalize_email(email: &str) -> Option<String> {
    let email = email.trim().to_lowercase();
    let (local, domain) = email.split_once('@')?;
    let valid = !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.chars().any(char::is_whitespace)
        && email.len() <= 254;
    valid.then_some(email)
}

/// 8 to 128 characters with at least one letter and one digit.
pub fn check_password_strength(password: &str) -> Result<(), &'static str> {
    let length = password.chars().count();
    if !(8..=128).contains(&length) {
        return Err("Password must be between 8 and 128 characters");
    }
    if !password.chars().any(char::is_alphabetic) || !password.chars().any(|c| c.is_ascii_digit()) {
        return Err("Password must contain at least one letter and one digit");
    }
    Ok(())
}
