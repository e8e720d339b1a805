use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use crate::access::{require_role, AccessScope, Role};
use crate::auth::AuthUser;
use crate::db::operations::assessments::{
    self, Assessment, AssessmentChanges, AssessmentFilter, NewAssessment, NewSubmission, Submission,
};
use crate::db::operations::questions::{self, Question};
use crate::db::operations::{groups, modules};
use crate::db::{now_ms, parse_iso_ms, DatabaseProxy};
use crate::response::{created, ok, AppError, SuccessResponse};
use crate::services::analytics::{self, SummaryStats};
use crate::services::grading::{self, QuestionResult};
use crate::state::AppState;

use super::double_option;
use super::modules::authored_module;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_assessments).post(create_assessment))
        .route(
            "/:id",
            get(get_assessment)
                .put(update_assessment)
                .delete(delete_assessment),
        )
        .route("/:id/submit", post(submit_assessment))
        .route("/:id/submissions", get(list_submissions))
        .route("/:id/stats", get(assessment_stats))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    module_id: Option<String>,
    group_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateAssessmentRequest {
    title: String,
    module_id: String,
    group_id: Option<String>,
    #[serde(default)]
    question_ids: Vec<String>,
    due_at: Option<String>,
    duration_minutes: Option<i64>,
    max_attempts: Option<i64>,
    is_published: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateAssessmentRequest {
    title: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    group_id: Option<Option<String>>,
    question_ids: Option<Vec<String>>,
    #[serde(default, deserialize_with = "double_option")]
    due_at: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    duration_minutes: Option<Option<i64>>,
    max_attempts: Option<i64>,
    is_published: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    #[serde(default)]
    answers: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AssessmentDetail {
    #[serde(flatten)]
    assessment: Assessment,
    questions: Vec<Question>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmissionResult {
    submission: Submission,
    results: Vec<QuestionResult>,
    attempts_remaining: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AssessmentStats {
    assessment_id: String,
    title: String,
    total_marks: i64,
    #[serde(flatten)]
    summary: SummaryStats,
}

async fn list_assessments(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    let filter = AssessmentFilter {
        module_id: super::non_blank(query.module_id),
        group_id: super::non_blank(query.group_id),
    };
    Ok(ok(assessments::list_assessments(&proxy, &scope, &filter).await?))
}

async fn create_assessment(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(payload): Json<CreateAssessmentRequest>,
) -> Result<impl IntoResponse, AppError> {
    require_role(&user, &[Role::Admin, Role::Hod, Role::Teacher])?;
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;

    let title = payload.title.trim();
    if title.is_empty() {
        return Err(AppError::validation("Assessment title is required"));
    }
    let module = authored_module(&proxy, &scope, &payload.module_id)
        .await
        .map_err(|err| match err.status() {
            StatusCode::NOT_FOUND => AppError::validation("Module does not exist"),
            _ => err,
        })?;

    let group_id = super::non_blank(payload.group_id);
    check_group(&proxy, &scope, group_id.as_deref(), &module.department_id).await?;
    let question_ids = check_questions(&proxy, &module.id, payload.question_ids).await?;
    let due_at = parse_due_at(payload.due_at.as_deref())?;
    check_duration(payload.duration_minutes)?;
    let max_attempts = payload.max_attempts.unwrap_or(1);
    check_max_attempts(max_attempts)?;

    let assessment = assessments::insert_assessment(
        &proxy,
        NewAssessment {
            title: title.to_string(),
            module_id: module.id,
            group_id,
            due_at,
            duration_minutes: payload.duration_minutes,
            max_attempts,
            is_published: payload.is_published.unwrap_or(false),
            created_by: user.id.clone(),
            question_ids,
        },
    )
    .await?;
    tracing::info!(assessment_id = %assessment.id, module_id = %assessment.module_id, "assessment created");
    Ok(created(assessment))
}

async fn get_assessment(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    let assessment = visible_assessment(&proxy, &scope, &id).await?;

    let mut questions = questions::questions_by_ids(&proxy, &assessment.question_ids).await?;
    if scope.is_student() {
        questions = questions.into_iter().map(Question::without_answer).collect();
    }
    Ok(ok(AssessmentDetail {
        assessment,
        questions,
    }))
}

async fn update_assessment(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateAssessmentRequest>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    let assessment = authored_assessment(&proxy, &scope, &id).await?;

    if let Some(title) = &payload.title {
        if title.trim().is_empty() {
            return Err(AppError::validation("Assessment title cannot be empty"));
        }
    }
    let group_id = payload.group_id.map(super::non_blank);
    if let Some(group_id) = &group_id {
        check_group(&proxy, &scope, group_id.as_deref(), &assessment.department_id).await?;
    }
    let question_ids = match payload.question_ids {
        Some(ids) => Some(check_questions(&proxy, &assessment.module_id, ids).await?),
        None => None,
    };
    let due_at = match payload.due_at {
        Some(value) => Some(parse_due_at(value.as_deref())?),
        None => None,
    };
    if let Some(duration) = payload.duration_minutes {
        check_duration(duration)?;
    }
    if let Some(max_attempts) = payload.max_attempts {
        check_max_attempts(max_attempts)?;
    }

    let changes = AssessmentChanges {
        title: payload.title,
        group_id,
        due_at,
        duration_minutes: payload.duration_minutes,
        max_attempts: payload.max_attempts,
        is_published: payload.is_published,
        question_ids,
    };
    let assessment = assessments::update_assessment(&proxy, &id, changes)
        .await?
        .ok_or_else(|| AppError::not_found("Assessment not found"))?;
    Ok(ok(assessment))
}

async fn delete_assessment(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    authored_assessment(&proxy, &scope, &id).await?;
    let affected = assessments::students_with_submissions(&proxy, std::slice::from_ref(&id)).await?;
    assessments::delete_assessment(&proxy, &id).await?;
    refresh_student_metrics(&state, &proxy, &affected).await?;
    tracing::info!(
        assessment_id = %id,
        actor_id = %user.id,
        students = affected.len(),
        "assessment deleted"
    );
    Ok(ok(serde_json::json!({ "id": id })))
}

/// Grades the student's answers, stores the attempt and refreshes their metric.
async fn submit_assessment(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(payload): Json<SubmitRequest>,
) -> Result<impl IntoResponse, AppError> {
    require_role(&user, &[Role::Student])?;
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    let assessment = visible_assessment(&proxy, &scope, &id).await?;

    if assessment.is_closed(now_ms()) {
        return Err(AppError::bad_request("Assessment is closed").with_code("ASSESSMENT_CLOSED"));
    }
    let questions = questions::questions_by_ids(&proxy, &assessment.question_ids).await?;
    let graded = grading::grade(&questions, &payload.answers);
    let answers = serde_json::to_value(&payload.answers)
        .map_err(|err| AppError::internal(err.to_string()))?;

    let submission = assessments::insert_submission(
        &proxy,
        NewSubmission {
            assessment_id: id.clone(),
            student_id: user.id.clone(),
            answers,
            score: graded.score,
            max_score: graded.max_score,
            percentage: graded.percentage,
        },
        assessment.max_attempts,
    )
    .await?
    .ok_or_else(|| {
        AppError::conflict(format!(
            "All {} attempts have been used",
            assessment.max_attempts
        ))
        .with_code("ATTEMPTS_EXHAUSTED")
    })?;
    refresh_student_metrics(&state, &proxy, std::slice::from_ref(&user.id)).await?;

    tracing::info!(
        assessment_id = %id,
        student_id = %user.id,
        attempt = submission.attempt,
        percentage = submission.percentage,
        "assessment submitted"
    );
    let attempts_remaining = (assessment.max_attempts - submission.attempt).max(0);
    Ok((
        StatusCode::CREATED,
        Json(SuccessResponse {
            success: true,
            data: SubmissionResult {
                submission,
                results: graded.results,
                attempts_remaining,
            },
        }),
    ))
}

async fn list_submissions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    visible_assessment(&proxy, &scope, &id).await?;

    let own = scope.is_student().then_some(user.id.as_str());
    Ok(ok(assessments::submissions_for_assessment(&proxy, &id, own).await?))
}

async fn assessment_stats(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    require_role(&user, &[Role::Admin, Role::Hod, Role::Teacher])?;
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    let assessment = visible_assessment(&proxy, &scope, &id).await?;

    let percentages = assessments::assessment_percentages(&proxy, &id).await?;
    Ok(ok(AssessmentStats {
        assessment_id: assessment.id,
        title: assessment.title,
        total_marks: assessment.total_marks,
        summary: analytics::summarize(&percentages),
    }))
}

/// Recomputes each student's stored metric and drops their cached summary.
pub(crate) async fn refresh_student_metrics(
    state: &AppState,
    proxy: &DatabaseProxy,
    student_ids: &[String],
) -> Result<(), AppError> {
    for student_id in student_ids {
        analytics::recompute_metric(proxy, student_id).await?;
        if let Some(cache) = state.cache() {
            cache
                .delete(&crate::cache::keys::student_summary_key(student_id))
                .await;
        }
    }
    Ok(())
}

/// An assessment the caller can see. Students additionally need both the assessment
/// and its module published and aimed at their group.
async fn visible_assessment(
    proxy: &DatabaseProxy,
    scope: &AccessScope,
    id: &str,
) -> Result<Assessment, AppError> {
    let not_found = || AppError::not_found("Assessment not found");
    let assessment = assessments::find_assessment(proxy, id)
        .await?
        .ok_or_else(not_found)?;
    let module = modules::find_module(proxy, &assessment.module_id)
        .await?
        .ok_or_else(not_found)?;

    let visible = scope.can_view_content(
        &module.department_id,
        module.group_id.as_deref(),
        module.is_published,
    ) && scope.can_view_content(
        &assessment.department_id,
        assessment.group_id.as_deref(),
        assessment.is_published,
    );
    if !visible {
        return Err(not_found());
    }
    Ok(assessment)
}

async fn authored_assessment(
    proxy: &DatabaseProxy,
    scope: &AccessScope,
    id: &str,
) -> Result<Assessment, AppError> {
    let assessment = visible_assessment(proxy, scope, id).await?;
    authored_module(proxy, scope, &assessment.module_id).await?;
    if !scope.can_author(&assessment.department_id, assessment.group_id.as_deref()) {
        return Err(AppError::forbidden("You cannot edit this assessment"));
    }
    Ok(assessment)
}

async fn check_group(
    proxy: &DatabaseProxy,
    scope: &AccessScope,
    group_id: Option<&str>,
    department_id: &str,
) -> Result<(), AppError> {
    if let Some(group_id) = group_id {
        let group = groups::find_group(proxy, group_id)
            .await?
            .ok_or_else(|| AppError::validation("Group does not exist"))?;
        if group.department_id != department_id {
            return Err(AppError::validation(
                "Group must belong to the module's department",
            ));
        }
    }
    if !scope.can_author(department_id, group_id) {
        return Err(AppError::forbidden("You cannot assign assessments to that group"));
    }
    Ok(())
}

/// Deduplicates the ids, keeping first-seen order, and checks each belongs to the module.
async fn check_questions(
    proxy: &DatabaseProxy,
    module_id: &str,
    ids: Vec<String>,
) -> Result<Vec<String>, AppError> {
    let mut unique: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        let id = id.trim().to_string();
        if !id.is_empty() && !unique.contains(&id) {
            unique.push(id);
        }
    }
    if unique.is_empty() {
        return Err(AppError::validation("An assessment needs at least one question"));
    }

    let found = questions::questions_by_ids(proxy, &unique).await?;
    if found.len() != unique.len() {
        return Err(AppError::validation("Some questions do not exist"));
    }
    if found.iter().any(|q| q.module_id != module_id) {
        return Err(AppError::validation(
            "All questions must belong to the assessment's module",
        ));
    }
    Ok(unique)
}

fn parse_due_at(value: Option<&str>) -> Result<Option<i64>, AppError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(value) => parse_iso_ms(value)
            .map(Some)
            .ok_or_else(|| AppError::validation("dueAt must be an RFC 3339 timestamp")),
    }
}

fn check_duration(duration_minutes: Option<i64>) -> Result<(), AppError> {
    match duration_minutes {
        Some(minutes) if minutes <= 0 => {
            Err(AppError::validation("durationMinutes must be greater than zero"))
        }
        _ => Ok(()),
    }
}

fn check_max_attempts(max_attempts: i64) -> Result<(), AppError> {
    if max_attempts < 1 {
        return Err(AppError::validation("maxAttempts must be at least 1"));
    }
    Ok(())
}
