use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde::Deserialize;

use crate::access::{require_role, AccessScope, Role};
use crate::auth::AuthUser;
use crate::db::operations::departments::{self, DepartmentChanges};
use crate::db::operations::users;
use crate::db::DatabaseProxy;
use crate::response::{created, ok, AppError};
use crate::state::AppState;

use super::double_option;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_departments).post(create_department))
        .route(
            "/:id",
            get(get_department)
                .put(update_department)
                .delete(delete_department),
        )
}

#[derive(Debug, Deserialize)]
struct CreateDepartmentRequest {
    name: String,
    code: String,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateDepartmentRequest {
    name: Option<String>,
    code: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    description: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    hod_id: Option<Option<String>>,
}

async fn list_departments(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    Ok(ok(departments::list_departments(&proxy, &scope).await?))
}

async fn create_department(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(payload): Json<CreateDepartmentRequest>,
) -> Result<impl IntoResponse, AppError> {
    require_role(&user, &[Role::Admin])?;
    let proxy = state.require_db()?;

    let name = payload.name.trim();
    let code = departments::normalize_code(&payload.code);
    if name.is_empty() || code.is_empty() {
        return Err(AppError::validation("Department name and code are required"));
    }

    let description = super::non_blank(payload.description);
    let department =
        departments::insert_department(&proxy, name, &code, description.as_deref()).await?;
    tracing::info!(department_id = %department.id, code = %department.code, "department created");
    Ok(created(department))
}

async fn get_department(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    let department = departments::find_department(&proxy, &id)
        .await?
        .filter(|d| scope.can_see_department(&d.id))
        .ok_or_else(|| AppError::not_found("Department not found"))?;
    Ok(ok(department))
}

async fn update_department(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateDepartmentRequest>,
) -> Result<impl IntoResponse, AppError> {
    require_role(&user, &[Role::Admin, Role::Hod])?;
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    departments::find_department(&proxy, &id)
        .await?
        .filter(|d| scope.can_see_department(&d.id))
        .ok_or_else(|| AppError::not_found("Department not found"))?;

    if user.role == Role::Hod
        && (payload.name.is_some() || payload.code.is_some() || payload.hod_id.is_some())
    {
        return Err(AppError::forbidden(
            "HODs may only edit their department's description",
        ));
    }

    if let Some(name) = &payload.name {
        if name.trim().is_empty() {
            return Err(AppError::validation("Department name cannot be empty"));
        }
    }
    if let Some(code) = &payload.code {
        if code.trim().is_empty() {
            return Err(AppError::validation("Department code cannot be empty"));
        }
    }
    let hod_id = payload.hod_id.map(super::non_blank);
    if let Some(Some(hod_id)) = &hod_id {
        check_hod(&proxy, hod_id).await?;
    }

    let changes = DepartmentChanges {
        name: payload.name,
        code: payload.code,
        description: payload.description.map(super::non_blank),
        hod_id,
    };
    let department = departments::update_department(&proxy, &id, changes)
        .await?
        .ok_or_else(|| AppError::not_found("Department not found"))?;
    Ok(ok(department))
}

async fn check_hod(proxy: &DatabaseProxy, hod_id: &str) -> Result<(), AppError> {
    let candidate = users::find_user(proxy, hod_id)
        .await?
        .ok_or_else(|| AppError::validation("HOD user does not exist"))?;
    if candidate.role != Role::Hod {
        return Err(AppError::validation("Assigned user must have the HOD role"));
    }
    Ok(())
}

async fn delete_department(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    require_role(&user, &[Role::Admin])?;
    let proxy = state.require_db()?;
    if departments::find_department(&proxy, &id).await?.is_none() {
        return Err(AppError::not_found("Department not found"));
    }

    let usage = departments::department_usage(&proxy, &id).await?;
    if !usage.is_empty() {
        return Err(AppError::conflict(format!(
            "Department is still in use by {} groups, {} users and {} modules",
            usage.groups, usage.users, usage.modules
        ))
        .with_code("DEPARTMENT_IN_USE"));
    }

    departments::delete_department(&proxy, &id).await?;
    tracing::info!(department_id = %id, "department deleted");
    Ok(ok(serde_json::json!({ "id": id })))
}
