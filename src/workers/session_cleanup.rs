use std::sync::Arc;
use std::time::Instant;

use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::db::{now_ms, DatabaseProxy};

/// Deletes sessions past their expiry. Returns how many were removed.
pub async fn cleanup_expired_sessions(db: Arc<DatabaseProxy>) -> Result<u64, super::WorkerError> {
    let start = Instant::now();
    debug!("Starting session cleanup cycle");

    let deleted = delete_expired_sessions(db.pool(), now_ms()).await?;

    info!(
        expired_sessions = deleted,
        duration_secs = format!("{:.2}", start.elapsed().as_secs_f64()),
        "Session cleanup completed"
    );

    Ok(deleted)
}

async fn delete_expired_sessions(pool: &SqlitePool, now: i64) -> Result<u64, super::WorkerError> {
    let result = sqlx::query(
        r#"
        DELETE FROM "sessions"
        WHERE "expiresAt" < ?
        "#,
    )
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
