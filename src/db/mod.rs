pub mod operations;
pub mod schema;

use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, TimeZone, Utc};
use serde::Serializer;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;

use crate::config::Config;

#[derive(Clone)]
pub struct DatabaseProxy {
    url: String,
    pool: SqlitePool,
}

impl DatabaseProxy {
    pub async fn from_config(config: &Config) -> Result<Self, DbInitError> {
        Self::connect(&config.database_url, config.database_max_connections).await
    }

    /// Opens the pool and applies the embedded schema.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, DbInitError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(DbInitError::Sqlx)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // An in-memory database lives only as long as its connection.
        let pool_options = if is_memory_url(url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(5))
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(DbInitError::Sqlx)?;

        schema::apply(&pool).await.map_err(DbInitError::Schema)?;

        tracing::info!(url = %redact_url(url), "database ready");

        Ok(Self {
            url: url.to_string(),
            pool,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn connection_string(&self) -> &str {
        &self.url
    }

    /// Round-trip latency of a trivial query.
    pub async fn ping(&self, timeout: Duration) -> Result<Duration, DbPingError> {
        let started = Instant::now();
        match tokio::time::timeout(timeout, sqlx::query("SELECT 1").execute(&self.pool)).await {
            Ok(Ok(_)) => Ok(started.elapsed()),
            Ok(Err(err)) => Err(DbPingError::Sqlx(err)),
            Err(_) => Err(DbPingError::Timeout),
        }
    }

    pub async fn delete_session_by_token_hash(&self, token_hash: &str) -> Result<(), sqlx::Error> {
        sqlx::query(r#"DELETE FROM "sessions" WHERE "token" = ?"#)
            .bind(token_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[derive(Debug, Error)]
pub enum DbInitError {
    #[error(transparent)]
    Sqlx(sqlx::Error),
    #[error("schema bootstrap failed: {0}")]
    Schema(sqlx::Error),
}

#[derive(Debug, Error)]
pub enum DbPingError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("timeout")]
    Timeout,
}

fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

fn redact_url(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn format_ms_iso(value: i64) -> String {
    Utc.timestamp_millis_opt(value)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| value.to_string())
}

/// Parses RFC 3339 or bare epoch milliseconds.
pub fn parse_iso_ms(value: &str) -> Option<i64> {
    let trimmed = value.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc).timestamp_millis());
    }
    trimmed.parse::<i64>().ok()
}

pub fn serialize_ms<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_ms_iso(*value))
}

pub fn serialize_opt_ms<S: Serializer>(
    value: &Option<i64>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(ms) => serializer.serialize_some(&format_ms_iso(*ms)),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_format_has_millis() {
        assert_eq!(format_ms_iso(0), "1970-01-01T00:00:00.000Z");
        assert_eq!(
            parse_iso_ms("2026-01-02T03:04:05.006Z"),
            Some(1_767_323_045_006)
        );
        assert_eq!(parse_iso_ms("1234"), Some(1234));
        assert_eq!(parse_iso_ms("next tuesday"), None);
    }

    #[test]
    fn memory_urls_are_detected() {
        assert!(is_memory_url("sqlite::memory:"));
        assert!(is_memory_url("sqlite://file?mode=memory&cache=shared"));
        assert!(!is_memory_url("sqlite://lms.db?mode=rwc"));
        assert_eq!(redact_url("sqlite://lms.db?mode=rwc"), "sqlite://lms.db");
    }
}
