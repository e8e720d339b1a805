use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde::Deserialize;

use crate::access::AccessScope;
use crate::auth::AuthUser;
use crate::db::operations::modules;
use crate::db::operations::questions::{
    self, Difficulty, NewQuestion, Question, QuestionKind, QuestionUpdate,
};
use crate::db::DatabaseProxy;
use crate::response::{created, ok, AppError};
use crate::services::grading;
use crate::state::AppState;

use super::modules::{authored_module, visible_module};

pub fn router() -> Router<AppState> {
    Router::new().route(
        "/:id",
        get(get_question).put(update_question).delete(delete_question),
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateQuestionRequest {
    prompt: String,
    kind: String,
    #[serde(default)]
    options: Vec<String>,
    correct_answer: String,
    marks: Option<i64>,
    difficulty: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateQuestionRequest {
    prompt: Option<String>,
    kind: Option<String>,
    options: Option<Vec<String>>,
    correct_answer: Option<String>,
    marks: Option<i64>,
    difficulty: Option<String>,
}

fn parse_kind(value: &str) -> Result<QuestionKind, AppError> {
    QuestionKind::parse(&value.trim().to_uppercase())
        .ok_or_else(|| AppError::validation("kind must be one of MCQ, TRUE_FALSE, SHORT"))
}

fn parse_difficulty(value: Option<&str>, fallback: Difficulty) -> Result<Difficulty, AppError> {
    match value {
        None => Ok(fallback),
        Some(value) => Difficulty::parse(&value.trim().to_uppercase())
            .ok_or_else(|| AppError::validation("difficulty must be one of EASY, MEDIUM, HARD")),
    }
}

pub(super) async fn list_for_module(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(module_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    visible_module(&proxy, &scope, &module_id).await?;

    let mut list = questions::questions_for_module(&proxy, &module_id).await?;
    if scope.is_student() {
        list = list.into_iter().map(Question::without_answer).collect();
    }
    Ok(ok(list))
}

pub(super) async fn create_for_module(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(module_id): Path<String>,
    Json(payload): Json<CreateQuestionRequest>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    authored_module(&proxy, &scope, &module_id).await?;

    let prompt = payload.prompt.trim();
    if prompt.is_empty() {
        return Err(AppError::validation("Question prompt is required"));
    }
    let kind = parse_kind(&payload.kind)?;
    let difficulty = parse_difficulty(payload.difficulty.as_deref(), Difficulty::Medium)?;
    let marks = payload.marks.unwrap_or(1);
    let (options, correct_answer) =
        grading::validate_question(kind, &payload.options, &payload.correct_answer, marks)
            .map_err(AppError::validation)?;

    let question = questions::insert_question(
        &proxy,
        NewQuestion {
            module_id,
            prompt: prompt.to_string(),
            kind,
            options,
            correct_answer,
            marks,
            difficulty,
            created_by: user.id.clone(),
        },
    )
    .await?;
    tracing::info!(question_id = %question.id, module_id = %question.module_id, "question created");
    Ok(created(question))
}

async fn get_question(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    let question = visible_question(&proxy, &scope, &id).await?;
    if scope.is_student() {
        return Ok(ok(question.without_answer()));
    }
    Ok(ok(question))
}

/// Merges the changes over the stored question and re-validates the whole definition.
async fn update_question(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateQuestionRequest>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    let existing = visible_question(&proxy, &scope, &id).await?;
    authored_module(&proxy, &scope, &existing.module_id).await?;

    let prompt = payload.prompt.unwrap_or(existing.prompt);
    if prompt.trim().is_empty() {
        return Err(AppError::validation("Question prompt cannot be empty"));
    }
    let kind = match payload.kind.as_deref() {
        Some(kind) => parse_kind(kind)?,
        None => existing.kind,
    };
    let difficulty = parse_difficulty(payload.difficulty.as_deref(), existing.difficulty)?;
    let marks = payload.marks.unwrap_or(existing.marks);
    let options = payload.options.unwrap_or(existing.options);
    let correct_answer = payload
        .correct_answer
        .or(existing.correct_answer)
        .unwrap_or_default();
    let (options, correct_answer) =
        grading::validate_question(kind, &options, &correct_answer, marks)
            .map_err(AppError::validation)?;

    let question = questions::update_question(
        &proxy,
        &id,
        QuestionUpdate {
            prompt,
            kind,
            options,
            correct_answer,
            marks,
            difficulty,
        },
    )
    .await?
    .ok_or_else(|| AppError::not_found("Question not found"))?;
    Ok(ok(question))
}

async fn delete_question(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    let question = visible_question(&proxy, &scope, &id).await?;
    authored_module(&proxy, &scope, &question.module_id).await?;
    questions::delete_question(&proxy, &id).await?;
    tracing::info!(question_id = %id, "question deleted");
    Ok(ok(serde_json::json!({ "id": id })))
}

async fn visible_question(
    proxy: &DatabaseProxy,
    scope: &AccessScope,
    id: &str,
) -> Result<Question, AppError> {
    let question = questions::find_question(proxy, id)
        .await?
        .ok_or_else(|| AppError::not_found("Question not found"))?;
    let visible = modules::find_module(proxy, &question.module_id)
        .await?
        .map_or(false, |m| {
            scope.can_view_content(&m.department_id, m.group_id.as_deref(), m.is_published)
        });
    if !visible {
        return Err(AppError::not_found("Question not found"));
    }
    Ok(question)
}
