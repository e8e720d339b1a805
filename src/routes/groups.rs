use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{delete, get};
use axum::{Extension, Json, Router};
use serde::Deserialize;

use crate::access::{require_role, AccessScope, Role};
use crate::auth::AuthUser;
use crate::db::operations::groups::{self, Group, GroupChanges, NewGroup};
use crate::db::operations::{departments, users};
use crate::db::DatabaseProxy;
use crate::response::{created, ok, AppError};
use crate::state::AppState;

use super::double_option;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_groups).post(create_group))
        .route("/:id", get(get_group).put(update_group).delete(delete_group))
        .route("/:id/members", get(list_members).post(add_members))
        .route("/:id/members/:user_id", delete(remove_member))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    department_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateGroupRequest {
    name: String,
    department_id: String,
    teacher_id: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateGroupRequest {
    name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    teacher_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    description: Option<Option<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MembersRequest {
    user_ids: Vec<String>,
}

async fn list_groups(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    let department_id = super::non_blank(query.department_id);
    Ok(ok(groups::list_groups(&proxy, &scope, department_id.as_deref()).await?))
}

async fn create_group(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(payload): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse, AppError> {
    require_role(&user, &[Role::Admin, Role::Hod])?;
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;

    let name = payload.name.trim();
    if name.is_empty() {
        return Err(AppError::validation("Group name is required"));
    }
    if departments::find_department(&proxy, &payload.department_id)
        .await?
        .is_none()
    {
        return Err(AppError::validation("Department does not exist"));
    }
    if !scope.can_manage_department(&payload.department_id) {
        return Err(AppError::forbidden("You cannot create groups in this department"));
    }

    let teacher_id = super::non_blank(payload.teacher_id);
    if let Some(teacher_id) = &teacher_id {
        check_teacher(&proxy, teacher_id, &payload.department_id).await?;
    }

    let group = groups::insert_group(
        &proxy,
        NewGroup {
            name: name.to_string(),
            department_id: payload.department_id,
            teacher_id,
            description: super::non_blank(payload.description),
        },
    )
    .await?;
    tracing::info!(group_id = %group.id, department_id = %group.department_id, "group created");
    Ok(created(group))
}

async fn get_group(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    Ok(ok(visible_group(&proxy, &scope, &id).await?))
}

async fn update_group(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateGroupRequest>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    let group = managed_group(&proxy, &scope, &id).await?;

    if let Some(name) = &payload.name {
        if name.trim().is_empty() {
            return Err(AppError::validation("Group name cannot be empty"));
        }
    }
    let teacher_id = payload.teacher_id.map(super::non_blank);
    if let Some(Some(teacher_id)) = &teacher_id {
        check_teacher(&proxy, teacher_id, &group.department_id).await?;
    }

    let changes = GroupChanges {
        name: payload.name,
        teacher_id,
        description: payload.description.map(super::non_blank),
    };
    let group = groups::update_group(&proxy, &id, changes)
        .await?
        .ok_or_else(|| AppError::not_found("Group not found"))?;
    Ok(ok(group))
}

async fn delete_group(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    managed_group(&proxy, &scope, &id).await?;
    groups::delete_group(&proxy, &id).await?;
    tracing::info!(group_id = %id, "group deleted");
    Ok(ok(serde_json::json!({ "id": id })))
}

async fn list_members(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    require_role(&user, &[Role::Admin, Role::Hod, Role::Teacher])?;
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    visible_group(&proxy, &scope, &id).await?;
    Ok(ok(users::students_in_group(&proxy, &id).await?))
}

/// Moves the listed students into the group.
async fn add_members(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(payload): Json<MembersRequest>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    let group = managed_group(&proxy, &scope, &id).await?;

    let mut ids = payload.user_ids;
    ids.sort();
    ids.dedup();
    if ids.is_empty() {
        return Err(AppError::validation("userIds must not be empty"));
    }

    let found = users::users_by_ids(&proxy, &ids).await?;
    if found.len() != ids.len() {
        return Err(AppError::validation("Some users do not exist"));
    }
    if let Some(bad) = found
        .iter()
        .find(|u| u.role != Role::Student || u.department_id.as_deref() != Some(group.department_id.as_str()))
    {
        return Err(AppError::validation(format!(
            "User {} is not a student of this group's department",
            bad.id
        )));
    }

    let moved = users::set_group(&proxy, &ids, Some(&id)).await?;
    tracing::info!(group_id = %id, moved, "group members added");
    Ok(ok(users::students_in_group(&proxy, &id).await?))
}

async fn remove_member(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path((id, user_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    managed_group(&proxy, &scope, &id).await?;

    let member = users::find_user(&proxy, &user_id)
        .await?
        .filter(|u| u.group_id.as_deref() == Some(id.as_str()))
        .ok_or_else(|| AppError::not_found("User is not a member of this group"))?;
    users::set_group(&proxy, &[member.id], None).await?;
    Ok(ok(serde_json::json!({ "groupId": id, "userId": user_id })))
}

async fn visible_group(
    proxy: &DatabaseProxy,
    scope: &AccessScope,
    id: &str,
) -> Result<Group, AppError> {
    groups::find_group(proxy, id)
        .await?
        .filter(|g| scope.can_see_group(&g.id, &g.department_id))
        .ok_or_else(|| AppError::not_found("Group not found"))
}

/// A group the caller can see and administer (Admin, or the HOD of its department).
async fn managed_group(
    proxy: &DatabaseProxy,
    scope: &AccessScope,
    id: &str,
) -> Result<Group, AppError> {
    let group = visible_group(proxy, scope, id).await?;
    if !scope.can_manage_department(&group.department_id) {
        return Err(AppError::forbidden("You cannot manage this group"));
    }
    Ok(group)
}

async fn check_teacher(
    proxy: &DatabaseProxy,
    teacher_id: &str,
    department_id: &str,
) -> Result<(), AppError> {
    let teacher = users::find_user(proxy, teacher_id)
        .await?
        .ok_or_else(|| AppError::validation("Teacher does not exist"))?;
    if teacher.role != Role::Teacher {
        return Err(AppError::validation("Assigned user must have the TEACHER role"));
    }
    if teacher.department_id.as_deref() != Some(department_id) {
        return Err(AppError::validation(
            "Teacher must belong to the group's department",
        ));
    }
    Ok(())
}
