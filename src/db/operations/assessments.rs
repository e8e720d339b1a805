use std::collections::HashMap;

use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use uuid::Uuid;

use crate::access::{AccessScope, ScopeColumns};
use crate::db::{now_ms, serialize_ms, serialize_opt_ms, DatabaseProxy};

const ASSESSMENT_SELECT: &str = r#"
    SELECT a."id", a."title", a."moduleId", m."departmentId", a."groupId", a."dueAt",
           a."durationMinutes", a."maxAttempts", a."isPublished", a."createdBy",
           a."createdAt", a."updatedAt",
           COALESCE((SELECT SUM(q."marks") FROM "assessment_questions" aq
                     JOIN "questions" q ON q."id" = aq."questionId"
                     WHERE aq."assessmentId" = a."id"), 0) AS "totalMarks"
    FROM "assessments" a
    JOIN "modules" m ON m."id" = a."moduleId"
"#;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assessment {
    pub id: String,
    pub title: String,
    pub module_id: String,
    pub department_id: String,
    pub group_id: Option<String>,
    #[serde(serialize_with = "serialize_opt_ms")]
    pub due_at: Option<i64>,
    pub duration_minutes: Option<i64>,
    pub max_attempts: i64,
    pub is_published: bool,
    pub created_by: String,
    pub question_ids: Vec<String>,
    pub total_marks: i64,
    #[serde(serialize_with = "serialize_ms")]
    pub created_at: i64,
    #[serde(serialize_with = "serialize_ms")]
    pub updated_at: i64,
}

impl Assessment {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            module_id: row.try_get("moduleId")?,
            department_id: row.try_get("departmentId")?,
            group_id: row.try_get("groupId")?,
            due_at: row.try_get("dueAt")?,
            duration_minutes: row.try_get("durationMinutes")?,
            max_attempts: row.try_get("maxAttempts")?,
            is_published: row.try_get("isPublished")?,
            created_by: row.try_get("createdBy")?,
            question_ids: Vec::new(),
            total_marks: row.try_get("totalMarks")?,
            created_at: row.try_get("createdAt")?,
            updated_at: row.try_get("updatedAt")?,
        })
    }

    pub fn is_closed(&self, now: i64) -> bool {
        self.due_at.map_or(false, |due| now > due)
    }
}

#[derive(Debug, Clone)]
pub struct NewAssessment {
    pub title: String,
    pub module_id: String,
    pub group_id: Option<String>,
    pub due_at: Option<i64>,
    pub duration_minutes: Option<i64>,
    pub max_attempts: i64,
    pub is_published: bool,
    pub created_by: String,
    pub question_ids: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AssessmentChanges {
    pub title: Option<String>,
    pub group_id: Option<Option<String>>,
    pub due_at: Option<Option<i64>>,
    pub duration_minutes: Option<Option<i64>>,
    pub max_attempts: Option<i64>,
    pub is_published: Option<bool>,
    pub question_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct AssessmentFilter {
    pub module_id: Option<String>,
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: String,
    pub assessment_id: String,
    pub student_id: String,
    pub answers: serde_json::Value,
    pub score: i64,
    pub max_score: i64,
    pub percentage: f64,
    pub attempt: i64,
    #[serde(serialize_with = "serialize_ms")]
    pub submitted_at: i64,
}

impl Submission {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let answers: String = row.try_get("answers")?;
        Ok(Self {
            id: row.try_get("id")?,
            assessment_id: row.try_get("assessmentId")?,
            student_id: row.try_get("studentId")?,
            answers: serde_json::from_str(&answers).unwrap_or(serde_json::Value::Null),
            score: row.try_get("score")?,
            max_score: row.try_get("maxScore")?,
            percentage: row.try_get("percentage")?,
            attempt: row.try_get("attempt")?,
            submitted_at: row.try_get("submittedAt")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewSubmission {
    pub assessment_id: String,
    pub student_id: String,
    pub answers: serde_json::Value,
    pub score: i64,
    pub max_score: i64,
    pub percentage: f64,
}

/// One of a student's submissions with the module it belongs to.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAttempt {
    pub assessment_id: String,
    pub assessment_title: String,
    pub module_id: String,
    pub module_title: String,
    pub percentage: f64,
    #[serde(serialize_with = "serialize_ms")]
    pub submitted_at: i64,
}

pub async fn insert_assessment(
    proxy: &DatabaseProxy,
    assessment: NewAssessment,
) -> Result<Assessment, sqlx::Error> {
    let id = Uuid::new_v4().to_string();
    let now = now_ms();
    let mut tx = proxy.pool().begin().await?;
    sqlx::query(
        r#"
        INSERT INTO "assessments" (
            "id", "title", "moduleId", "groupId", "dueAt", "durationMinutes",
            "maxAttempts", "isPublished", "createdBy", "createdAt", "updatedAt"
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(assessment.title.trim())
    .bind(&assessment.module_id)
    .bind(&assessment.group_id)
    .bind(assessment.due_at)
    .bind(assessment.duration_minutes)
    .bind(assessment.max_attempts)
    .bind(assessment.is_published)
    .bind(&assessment.created_by)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    write_question_links(&mut tx, &id, &assessment.question_ids).await?;
    tx.commit().await?;

    find_assessment(proxy, &id).await?.ok_or(sqlx::Error::RowNotFound)
}

async fn write_question_links(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    assessment_id: &str,
    question_ids: &[String],
) -> Result<(), sqlx::Error> {
    sqlx::query(r#"DELETE FROM "assessment_questions" WHERE "assessmentId" = ?"#)
        .bind(assessment_id)
        .execute(&mut **tx)
        .await?;
    for (position, question_id) in question_ids.iter().enumerate() {
        sqlx::query(
            r#"INSERT INTO "assessment_questions" ("assessmentId", "questionId", "position") VALUES (?, ?, ?)"#,
        )
        .bind(assessment_id)
        .bind(question_id)
        .bind(position as i64)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

pub async fn find_assessment(
    proxy: &DatabaseProxy,
    id: &str,
) -> Result<Option<Assessment>, sqlx::Error> {
    let row = sqlx::query(&format!(r#"{ASSESSMENT_SELECT} WHERE a."id" = ?"#))
        .bind(id)
        .fetch_optional(proxy.pool())
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let mut assessment = Assessment::from_row(&row)?;
    assessment.question_ids = question_ids(proxy, id).await?;
    Ok(Some(assessment))
}

pub async fn question_ids(proxy: &DatabaseProxy, assessment_id: &str) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar(
        r#"SELECT "questionId" FROM "assessment_questions" WHERE "assessmentId" = ? ORDER BY "position""#,
    )
    .bind(assessment_id)
    .fetch_all(proxy.pool())
    .await
}

pub async fn list_assessments(
    proxy: &DatabaseProxy,
    scope: &AccessScope,
    filter: &AssessmentFilter,
) -> Result<Vec<Assessment>, sqlx::Error> {
    let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!("{ASSESSMENT_SELECT} WHERE 1"));
    scope.push_filter(
        &mut builder,
        ScopeColumns {
            department: r#"m."departmentId""#,
            group: Some(r#"a."groupId""#),
        },
        Some(r#"a."isPublished""#),
    );
    if scope.is_student() {
        builder.push(r#" AND m."isPublished" = 1"#);
    }
    if let Some(module_id) = &filter.module_id {
        builder.push(r#" AND a."moduleId" = "#).push_bind(module_id.clone());
    }
    if let Some(group_id) = &filter.group_id {
        builder
            .push(r#" AND (a."groupId" IS NULL OR a."groupId" = "#)
            .push_bind(group_id.clone())
            .push(")");
    }
    builder.push(r#" ORDER BY COALESCE(a."dueAt", 9223372036854775807), a."createdAt" DESC"#);

    let rows = builder.build().fetch_all(proxy.pool()).await?;
    let mut assessments = rows
        .iter()
        .map(Assessment::from_row)
        .collect::<Result<Vec<_>, _>>()?;
    for assessment in &mut assessments {
        assessment.question_ids = question_ids(proxy, &assessment.id).await?;
    }
    Ok(assessments)
}

pub async fn update_assessment(
    proxy: &DatabaseProxy,
    id: &str,
    changes: AssessmentChanges,
) -> Result<Option<Assessment>, sqlx::Error> {
    let mut tx = proxy.pool().begin().await?;
    let mut builder: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new(r#"UPDATE "assessments" SET "updatedAt" = "#);
    builder.push_bind(now_ms());
    if let Some(title) = changes.title {
        builder.push(r#", "title" = "#).push_bind(title.trim().to_string());
    }
    if let Some(group_id) = changes.group_id {
        builder.push(r#", "groupId" = "#).push_bind(group_id);
    }
    if let Some(due_at) = changes.due_at {
        builder.push(r#", "dueAt" = "#).push_bind(due_at);
    }
    if let Some(duration_minutes) = changes.duration_minutes {
        builder.push(r#", "durationMinutes" = "#).push_bind(duration_minutes);
    }
    if let Some(max_attempts) = changes.max_attempts {
        builder.push(r#", "maxAttempts" = "#).push_bind(max_attempts);
    }
    if let Some(is_published) = changes.is_published {
        builder.push(r#", "isPublished" = "#).push_bind(is_published);
    }
    builder.push(r#" WHERE "id" = "#).push_bind(id.to_string());
    builder.build().execute(&mut *tx).await?;

    if let Some(question_ids) = &changes.question_ids {
        write_question_links(&mut tx, id, question_ids).await?;
    }
    tx.commit().await?;

    find_assessment(proxy, id).await
}

pub async fn delete_assessment(proxy: &DatabaseProxy, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(r#"DELETE FROM "assessments" WHERE "id" = ?"#)
        .bind(id)
        .execute(proxy.pool())
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn count_assessments(proxy: &DatabaseProxy) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(r#"SELECT COUNT(*) FROM "assessments""#)
        .fetch_one(proxy.pool())
        .await
}

/// Records a submission unless the student has already used `max_attempts`, returning
/// `None` in that case. The count and the insert are one statement, so SQLite takes the
/// write lock before counting and concurrent submissions queue instead of overshooting.
pub async fn insert_submission(
    proxy: &DatabaseProxy,
    submission: NewSubmission,
    max_attempts: i64,
) -> Result<Option<Submission>, sqlx::Error> {
    let id = Uuid::new_v4().to_string();
    let result = sqlx::query(
        r#"
        INSERT INTO "submissions" (
            "id", "assessmentId", "studentId", "answers", "score", "maxScore",
            "percentage", "attempt", "submittedAt"
        )
        SELECT ?, ?, ?, ?, ?, ?, ?, used."count" + 1, ?
        FROM (
            SELECT COUNT(*) AS "count" FROM "submissions"
            WHERE "assessmentId" = ? AND "studentId" = ?
        ) used
        WHERE used."count" < ?
        "#,
    )
    .bind(&id)
    .bind(&submission.assessment_id)
    .bind(&submission.student_id)
    .bind(submission.answers.to_string())
    .bind(submission.score)
    .bind(submission.max_score)
    .bind(submission.percentage)
    .bind(now_ms())
    .bind(&submission.assessment_id)
    .bind(&submission.student_id)
    .bind(max_attempts)
    .execute(proxy.pool())
    .await?;
    if result.rows_affected() == 0 {
        return Ok(None);
    }

    let row = sqlx::query(r#"SELECT * FROM "submissions" WHERE "id" = ?"#)
        .bind(&id)
        .fetch_one(proxy.pool())
        .await?;
    Submission::from_row(&row).map(Some)
}

/// Students with at least one submission on any of the assessments.
pub async fn students_with_submissions(
    proxy: &DatabaseProxy,
    assessment_ids: &[String],
) -> Result<Vec<String>, sqlx::Error> {
    if assessment_ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
        r#"SELECT DISTINCT "studentId" FROM "submissions" WHERE "assessmentId" IN ("#,
    );
    let mut separated = builder.separated(", ");
    for id in assessment_ids {
        separated.push_bind(id.clone());
    }
    separated.push_unseparated(")");
    builder.build_query_scalar().fetch_all(proxy.pool()).await
}

/// Ids of every assessment in the module.
pub async fn assessment_ids_for_module(
    proxy: &DatabaseProxy,
    module_id: &str,
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar(r#"SELECT "id" FROM "assessments" WHERE "moduleId" = ?"#)
        .bind(module_id)
        .fetch_all(proxy.pool())
        .await
}

pub async fn submissions_for_assessment(
    proxy: &DatabaseProxy,
    assessment_id: &str,
    student_id: Option<&str>,
) -> Result<Vec<Submission>, sqlx::Error> {
    let mut builder: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new(r#"SELECT * FROM "submissions" WHERE "assessmentId" = "#);
    builder.push_bind(assessment_id.to_string());
    if let Some(student_id) = student_id {
        builder.push(r#" AND "studentId" = "#).push_bind(student_id.to_string());
    }
    builder.push(r#" ORDER BY "submittedAt" DESC"#);
    let rows = builder.build().fetch_all(proxy.pool()).await?;
    rows.iter().map(Submission::from_row).collect()
}

/// Every submission of the student, oldest first.
pub async fn attempts_for_student(
    proxy: &DatabaseProxy,
    student_id: &str,
) -> Result<Vec<StudentAttempt>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT s."assessmentId", a."title" AS "assessmentTitle", a."moduleId",
               m."title" AS "moduleTitle", s."percentage", s."submittedAt"
        FROM "submissions" s
        JOIN "assessments" a ON a."id" = s."assessmentId"
        JOIN "modules" m ON m."id" = a."moduleId"
        WHERE s."studentId" = ?
        ORDER BY s."submittedAt", s."id"
        "#,
    )
    .bind(student_id)
    .fetch_all(proxy.pool())
    .await?;

    rows.iter()
        .map(|row| {
            Ok(StudentAttempt {
                assessment_id: row.try_get("assessmentId")?,
                assessment_title: row.try_get("assessmentTitle")?,
                module_id: row.try_get("moduleId")?,
                module_title: row.try_get("moduleTitle")?,
                percentage: row.try_get("percentage")?,
                submitted_at: row.try_get("submittedAt")?,
            })
        })
        .collect()
}

/// For each module with assessments the student can take, their best percentage across
/// them (`None` when never attempted). Modules with nothing in the student's reach are absent.
pub async fn best_percentage_by_module(
    proxy: &DatabaseProxy,
    scope: &AccessScope,
    student_id: &str,
    module_ids: &[String],
) -> Result<HashMap<String, Option<f64>>, sqlx::Error> {
    if module_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
        r#"
        SELECT a."moduleId", MAX(s."percentage")
        FROM "assessments" a
        JOIN "modules" m ON m."id" = a."moduleId"
        LEFT JOIN "submissions" s ON s."assessmentId" = a."id" AND s."studentId" = "#,
    );
    builder.push_bind(student_id.to_string());
    builder.push(r#" WHERE a."isPublished" = 1"#);
    scope.push_filter(
        &mut builder,
        ScopeColumns {
            department: r#"m."departmentId""#,
            group: Some(r#"m."groupId""#),
        },
        Some(r#"m."isPublished""#),
    );
    scope.push_filter(
        &mut builder,
        ScopeColumns {
            department: r#"m."departmentId""#,
            group: Some(r#"a."groupId""#),
        },
        None,
    );
    builder.push(r#" AND a."moduleId" IN ("#);
    let mut separated = builder.separated(", ");
    for id in module_ids {
        separated.push_bind(id.clone());
    }
    separated.push_unseparated(r#") GROUP BY a."moduleId""#);

    let rows: Vec<(String, Option<f64>)> = builder.build_query_as().fetch_all(proxy.pool()).await?;
    Ok(rows.into_iter().collect())
}

pub async fn assessment_percentages(
    proxy: &DatabaseProxy,
    assessment_id: &str,
) -> Result<Vec<f64>, sqlx::Error> {
    sqlx::query_scalar(r#"SELECT "percentage" FROM "submissions" WHERE "assessmentId" = ?"#)
        .bind(assessment_id)
        .fetch_all(proxy.pool())
        .await
}

pub async fn count_submissions_since(proxy: &DatabaseProxy, since_ms: i64) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(r#"SELECT COUNT(*) FROM "submissions" WHERE "submittedAt" >= ?"#)
        .bind(since_ms)
        .fetch_one(proxy.pool())
        .await
}
