//! Score aggregation: streaks, medians, distributions and the per-student
//! [`PerformanceMetric`] built from them.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;

use crate::db::operations::metrics::{self, PerformanceMetric};
use crate::db::DatabaseProxy;

/// Best percentage a student needs on a module's assessment to count it as passed.
pub const PASS_THRESHOLD: f64 = 50.0;

const BUCKET_LABELS: [&str; 10] = [
    "0-9", "10-19", "20-29", "30-39", "40-49", "50-59", "60-69", "70-79", "80-89", "90-100",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bucket {
    pub range: &'static str,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryStats {
    pub count: usize,
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub pass_rate: Option<f64>,
    pub distribution: Vec<Bucket>,
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(round2(values.iter().sum::<f64>() / values.len() as f64))
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    let value = if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    };
    Some(round2(value))
}

fn bucket_index(percentage: f64) -> usize {
    if !percentage.is_finite() || percentage < 0.0 {
        return 0;
    }
    ((percentage / 10.0).floor() as usize).min(BUCKET_LABELS.len() - 1)
}

/// Ten-point buckets; 100 lands in `90-100`.
pub fn distribution(values: &[f64]) -> Vec<Bucket> {
    let mut counts = [0u64; 10];
    for value in values {
        counts[bucket_index(*value)] += 1;
    }
    BUCKET_LABELS
        .iter()
        .zip(counts)
        .map(|(range, count)| Bucket { range: *range, count })
        .collect()
}

pub fn summarize(values: &[f64]) -> SummaryStats {
    let passed = values.iter().filter(|v| **v >= PASS_THRESHOLD).count();
    SummaryStats {
        count: values.len(),
        mean: mean(values),
        median: median(values),
        min: values.iter().copied().reduce(f64::min),
        max: values.iter().copied().reduce(f64::max),
        pass_rate: (!values.is_empty()).then(|| round2(passed as f64 * 100.0 / values.len() as f64)),
        distribution: distribution(values),
    }
}

pub fn utc_day(ms: i64) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp_millis(ms).map(|dt| dt.date_naive())
}

/// `(current, longest)` runs of consecutive active days. The current run must end
/// today or yesterday.
pub fn streaks(days: &BTreeSet<NaiveDate>, today: NaiveDate) -> (i64, i64) {
    let mut longest = 0;
    let mut run = 0;
    let mut previous: Option<NaiveDate> = None;
    for day in days {
        run = match previous {
            Some(prev) if *day - prev == Duration::days(1) => run + 1,
            _ => 1,
        };
        longest = longest.max(run);
        previous = Some(*day);
    }

    let current = match previous {
        Some(last) if last == today || last == today - Duration::days(1) => run,
        _ => 0,
    };
    (current, longest)
}

/// Builds the metric from `(percentage, submittedAt)` pairs.
pub fn compute_metric(student_id: &str, history: &[(f64, i64)], now_ms: i64) -> PerformanceMetric {
    let percentages: Vec<f64> = history.iter().map(|(p, _)| *p).collect();
    let days: BTreeSet<NaiveDate> = history.iter().filter_map(|(_, at)| utc_day(*at)).collect();
    let today = utc_day(now_ms).unwrap_or_else(|| Utc::now().date_naive());
    let (current_streak, longest_streak) = streaks(&days, today);

    PerformanceMetric {
        student_id: student_id.to_string(),
        total_submissions: history.len() as i64,
        average_percentage: mean(&percentages).unwrap_or(0.0),
        best_percentage: percentages.iter().copied().reduce(f64::max).unwrap_or(0.0),
        median_percentage: median(&percentages),
        current_streak,
        longest_streak,
        last_active_date: days.iter().next_back().map(|d| d.format("%Y-%m-%d").to_string()),
        updated_at: now_ms,
    }
}

/// Recomputes and stores the student's metric from all of their submissions.
pub async fn recompute_metric(
    proxy: &DatabaseProxy,
    student_id: &str,
) -> Result<PerformanceMetric, sqlx::Error> {
    let history = metrics::submission_history(proxy, student_id).await?;
    let metric = compute_metric(student_id, &history, crate::db::now_ms());
    metrics::upsert_metric(proxy, &metric).await?;
    tracing::debug!(
        student_id = %student_id,
        total = metric.total_submissions,
        streak = metric.current_streak,
        "performance metric updated"
    );
    Ok(metric)
}

/// The stored metric, or an empty one when the student never submitted. A current streak
/// that lapsed since the last recompute reads as zero.
pub async fn load_metric(
    proxy: &DatabaseProxy,
    student_id: &str,
) -> Result<PerformanceMetric, sqlx::Error> {
    let Some(mut metric) = metrics::find_metric(proxy, student_id).await? else {
        return Ok(PerformanceMetric::empty(student_id));
    };
    let today = Utc::now().date_naive();
    let last = metric
        .last_active_date
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());
    if !matches!(last, Some(day) if day >= today - Duration::days(1)) {
        metric.current_streak = 0;
    }
    Ok(metric)
}
