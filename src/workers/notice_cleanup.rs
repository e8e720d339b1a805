use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::db::operations::notices;
use crate::db::{now_ms, DatabaseProxy};

const DEFAULT_RETENTION_DAYS: i64 = 30;
const DAY_MS: i64 = 24 * 60 * 60 * 1000;

pub(super) fn retention_days() -> i64 {
    std::env::var("NOTICE_RETENTION_DAYS")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|days| *days >= 0)
        .unwrap_or(DEFAULT_RETENTION_DAYS)
}

/// Oldest expiry kept; saturates instead of overflowing for huge retention values.
fn retention_cutoff(now: i64, retention_days: i64) -> i64 {
    now.saturating_sub(retention_days.saturating_mul(DAY_MS))
}

/// Removes notices that expired more than `retention_days` ago, with their read markers.
pub async fn purge_expired_notices(
    db: Arc<DatabaseProxy>,
    retention_days: i64,
) -> Result<u64, super::WorkerError> {
    let start = Instant::now();
    let cutoff = retention_cutoff(now_ms(), retention_days);
    debug!(cutoff, "Starting notice cleanup cycle");

    let deleted = notices::delete_expired_before(&db, cutoff).await?;

    info!(
        deleted_notices = deleted,
        retention_days,
        duration_secs = format!("{:.2}", start.elapsed().as_secs_f64()),
        "Notice cleanup completed"
    );

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_steps_back_whole_days() {
        assert_eq!(retention_cutoff(10 * DAY_MS, 3), 7 * DAY_MS);
        assert_eq!(retention_cutoff(5, 0), 5);
    }

    #[test]
    fn cutoff_saturates_for_huge_retention() {
        assert_eq!(retention_cutoff(1_000, i64::MAX), 1_000 - i64::MAX);
        assert_eq!(retention_cutoff(i64::MIN + 5, 1), i64::MIN);
    }
}
