use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};

use crate::db::{now_ms, serialize_ms, DatabaseProxy};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetric {
    pub student_id: String,
    pub total_submissions: i64,
    pub average_percentage: f64,
    pub best_percentage: f64,
    pub median_percentage: Option<f64>,
    pub current_streak: i64,
    pub longest_streak: i64,
    pub last_active_date: Option<String>,
    #[serde(serialize_with = "serialize_ms")]
    pub updated_at: i64,
}

impl PerformanceMetric {
    pub fn empty(student_id: &str) -> Self {
        Self {
            student_id: student_id.to_string(),
            total_submissions: 0,
            average_percentage: 0.0,
            best_percentage: 0.0,
            median_percentage: None,
            current_streak: 0,
            longest_streak: 0,
            last_active_date: None,
            updated_at: now_ms(),
        }
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            student_id: row.try_get("studentId")?,
            total_submissions: row.try_get("totalSubmissions")?,
            average_percentage: row.try_get("averagePercentage")?,
            best_percentage: row.try_get("bestPercentage")?,
            median_percentage: row.try_get("medianPercentage")?,
            current_streak: row.try_get("currentStreak")?,
            longest_streak: row.try_get("longestStreak")?,
            last_active_date: row.try_get("lastActiveDate")?,
            updated_at: row.try_get("updatedAt")?,
        })
    }
}

pub async fn upsert_metric(proxy: &DatabaseProxy, metric: &PerformanceMetric) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO "performance_metrics" (
            "studentId", "totalSubmissions", "averagePercentage", "bestPercentage",
            "medianPercentage", "currentStreak", "longestStreak", "lastActiveDate", "updatedAt"
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT ("studentId") DO UPDATE SET
            "totalSubmissions" = excluded."totalSubmissions",
            "averagePercentage" = excluded."averagePercentage",
            "bestPercentage" = excluded."bestPercentage",
            "medianPercentage" = excluded."medianPercentage",
            "currentStreak" = excluded."currentStreak",
            "longestStreak" = excluded."longestStreak",
            "lastActiveDate" = excluded."lastActiveDate",
            "updatedAt" = excluded."updatedAt"
        "#,
    )
    .bind(&metric.student_id)
    .bind(metric.total_submissions)
    .bind(metric.average_percentage)
    .bind(metric.best_percentage)
    .bind(metric.median_percentage)
    .bind(metric.current_streak)
    .bind(metric.longest_streak)
    .bind(&metric.last_active_date)
    .bind(metric.updated_at)
    .execute(proxy.pool())
    .await?;
    Ok(())
}

pub async fn find_metric(
    proxy: &DatabaseProxy,
    student_id: &str,
) -> Result<Option<PerformanceMetric>, sqlx::Error> {
    let row = sqlx::query(r#"SELECT * FROM "performance_metrics" WHERE "studentId" = ?"#)
        .bind(student_id)
        .fetch_optional(proxy.pool())
        .await?;
    row.as_ref().map(PerformanceMetric::from_row).transpose()
}

pub async fn metrics_for_students(
    proxy: &DatabaseProxy,
    student_ids: &[String],
) -> Result<Vec<PerformanceMetric>, sqlx::Error> {
    if student_ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut builder: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new(r#"SELECT * FROM "performance_metrics" WHERE "studentId" IN ("#);
    let mut separated = builder.separated(", ");
    for id in student_ids {
        separated.push_bind(id.clone());
    }
    separated.push_unseparated(")");
    let rows = builder.build().fetch_all(proxy.pool()).await?;
    rows.iter().map(PerformanceMetric::from_row).collect()
}

/// `(percentage, submittedAt)` of every submission by the student.
pub async fn submission_history(
    proxy: &DatabaseProxy,
    student_id: &str,
) -> Result<Vec<(f64, i64)>, sqlx::Error> {
    sqlx::query_as(
        r#"SELECT "percentage", "submittedAt" FROM "submissions" WHERE "studentId" = ? ORDER BY "submittedAt""#,
    )
    .bind(student_id)
    .fetch_all(proxy.pool())
    .await
}
