use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{get, put};
use axum::{Extension, Json, Router};
use serde::Deserialize;

use crate::access::{require_role, AccessScope, Role};
use crate::auth::{self, AuthUser};
use crate::db::operations::groups;
use crate::db::operations::users::{self, NewUser, UserChanges, UserFilter, UserRecord};
use crate::db::DatabaseProxy;
use crate::response::{created, ok, paged, AppError, Page};
use crate::state::AppState;

use super::double_option;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_users).post(create_user))
        .route("/me", get(me).put(update_me))
        .route("/me/password", put(change_password))
        .route("/:id", get(get_user).put(update_user).delete(delete_user))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    role: Option<String>,
    department_id: Option<String>,
    group_id: Option<String>,
    search: Option<String>,
    page: Option<i64>,
    page_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct UpdateMeRequest {
    username: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangePasswordRequest {
    current_password: String,
    new_password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateUserRequest {
    email: String,
    password: String,
    username: String,
    role: String,
    department_id: Option<String>,
    group_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateUserRequest {
    username: Option<String>,
    role: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    department_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    group_id: Option<Option<String>>,
    is_active: Option<bool>,
}

async fn me(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let record = users::find_user(&proxy, &user.id)
        .await?
        .ok_or_else(|| AppError::not_found("User not found"))?;
    Ok(ok(record))
}

async fn update_me(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(payload): Json<UpdateMeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let username = payload.username.trim();
    if username.is_empty() {
        return Err(AppError::validation("Username is required"));
    }
    let changes = UserChanges {
        username: Some(username.to_string()),
        ..Default::default()
    };
    let record = users::update_user(&proxy, &user.id, changes)
        .await?
        .ok_or_else(|| AppError::not_found("User not found"))?;
    invalidate_cached_sessions(&state, &proxy, &user.id).await?;
    Ok(ok(record))
}

async fn change_password(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let stored = users::password_hash(&proxy, &user.id)
        .await?
        .ok_or_else(|| AppError::not_found("User not found"))?;
    if !auth::verify_password(&payload.current_password, &stored) {
        return Err(AppError::unauthorized("Current password is incorrect")
            .with_code("INVALID_CREDENTIALS"));
    }
    auth::check_password_strength(&payload.new_password).map_err(AppError::validation)?;

    let hash = auth::hash_password(&payload.new_password)?;
    users::update_password(&proxy, &user.id, &hash).await?;

    let current = auth::extract_token(&headers).map(|token| auth::hash_token(&token));
    let revoked =
        auth::revoke_user_sessions(&proxy, state.cache().as_deref(), &user.id, current.as_deref())
            .await?;
    tracing::info!(user_id = %user.id, revoked, "password changed");

    Ok(ok(serde_json::json!({ "message": "Password updated", "revokedSessions": revoked })))
}

async fn list_users(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, AppError> {
    require_role(&user, &[Role::Admin, Role::Hod, Role::Teacher])?;
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;

    let role = match query.role.as_deref().filter(|r| !r.trim().is_empty()) {
        Some(raw) => Some(Role::parse(raw).ok_or_else(|| AppError::validation("Unknown role"))?),
        None => None,
    };
    let filter = UserFilter {
        role,
        department_id: super::non_blank(query.department_id),
        group_id: super::non_blank(query.group_id),
        search: query.search,
    };
    let page = Page::new(query.page, query.page_size);
    let (records, total) = users::list_users(&proxy, &scope, &filter, page).await?;
    Ok(paged(records, total, page))
}

async fn create_user(
    State(state): State<AppState>,
    Extension(actor): Extension<AuthUser>,
    Json(payload): Json<CreateUserRequest>,
) -> Result<impl IntoResponse, AppError> {
    require_role(&actor, &[Role::Admin, Role::Hod])?;
    let proxy = state.require_db()?;

    let role = Role::parse(&payload.role).ok_or_else(|| AppError::validation("Unknown role"))?;
    let email = auth::normalize_email(&payload.email)
        .ok_or_else(|| AppError::validation("A valid email address is required"))?;
    auth::check_password_strength(&payload.password).map_err(AppError::validation)?;
    let username = payload.username.trim();
    if username.is_empty() {
        return Err(AppError::validation("Username is required"));
    }

    let mut department_id = super::non_blank(payload.department_id);
    if actor.role == Role::Hod {
        if !matches!(role, Role::Teacher | Role::Student) {
            return Err(AppError::forbidden("HODs may only create teachers and students"));
        }
        let own = actor
            .department_id
            .clone()
            .ok_or_else(|| AppError::forbidden("HOD account has no department"))?;
        if department_id.as_deref().map_or(false, |d| d != own) {
            return Err(AppError::forbidden("HODs may only create users in their own department"));
        }
        department_id = Some(own);
    }

    let group_id = super::non_blank(payload.group_id);
    check_assignment(&proxy, role, department_id.as_deref(), group_id.as_deref()).await?;

    if users::email_exists(&proxy, &email).await? {
        return Err(AppError::conflict("Email is already registered").with_code("EMAIL_EXISTS"));
    }

    let record = users::insert_user(
        &proxy,
        NewUser {
            email,
            username: username.to_string(),
            password_hash: auth::hash_password(&payload.password)?,
            role,
            department_id,
            group_id,
        },
    )
    .await?;
    tracing::info!(user_id = %record.id, actor_id = %actor.id, role = %record.role, "user created");
    Ok(created(record))
}

async fn get_user(
    State(state): State<AppState>,
    Extension(actor): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &actor).await?;
    let record = visible_user(&proxy, &scope, &actor, &id).await?;
    Ok(ok(record))
}

async fn update_user(
    State(state): State<AppState>,
    Extension(actor): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateUserRequest>,
) -> Result<impl IntoResponse, AppError> {
    require_role(&actor, &[Role::Admin, Role::Hod])?;
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &actor).await?;
    let existing = visible_user(&proxy, &scope, &actor, &id).await?;

    let role = match payload.role.as_deref() {
        Some(raw) => Some(Role::parse(raw).ok_or_else(|| AppError::validation("Unknown role"))?),
        None => None,
    };
    let department_id = payload.department_id.map(super::non_blank);
    let group_id = payload.group_id.map(super::non_blank);

    if actor.role == Role::Hod {
        let target_role = role.unwrap_or(existing.role);
        if !matches!(existing.role, Role::Teacher | Role::Student)
            || !matches!(target_role, Role::Teacher | Role::Student)
        {
            return Err(AppError::forbidden("HODs may only manage teachers and students"));
        }
        if let Some(department_id) = &department_id {
            if department_id.as_deref() != actor.department_id.as_deref() {
                return Err(AppError::forbidden(
                    "HODs cannot move users out of their department",
                ));
            }
        }
    }
    if actor.id == id && (role.map_or(false, |r| r != actor.role) || payload.is_active == Some(false)) {
        return Err(AppError::bad_request("You cannot change your own role or deactivate yourself"));
    }

    let final_role = role.unwrap_or(existing.role);
    let final_department = department_id.clone().unwrap_or(existing.department_id.clone());
    // A department change without an explicit group drops the old group.
    let final_group = match (&group_id, &department_id) {
        (Some(group), _) => group.clone(),
        (None, Some(dept)) if *dept != existing.department_id => None,
        (None, _) if final_role != Role::Student => None,
        (None, _) => existing.group_id.clone(),
    };
    check_assignment(&proxy, final_role, final_department.as_deref(), final_group.as_deref()).await?;

    let username = match payload.username {
        Some(name) if name.trim().is_empty() => {
            return Err(AppError::validation("Username cannot be empty"))
        }
        other => other,
    };
    let changes = UserChanges {
        username,
        role,
        department_id,
        group_id: (final_group != existing.group_id).then_some(final_group),
        is_active: payload.is_active,
    };
    let record = users::update_user(&proxy, &id, changes)
        .await?
        .ok_or_else(|| AppError::not_found("User not found"))?;

    if payload.is_active == Some(false) {
        let revoked = auth::revoke_user_sessions(&proxy, state.cache().as_deref(), &id, None).await?;
        tracing::info!(user_id = %id, actor_id = %actor.id, revoked, "user deactivated");
    } else {
        invalidate_cached_sessions(&state, &proxy, &id).await?;
    }
    Ok(ok(record))
}

async fn delete_user(
    State(state): State<AppState>,
    Extension(actor): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    require_role(&actor, &[Role::Admin])?;
    if actor.id == id {
        return Err(AppError::bad_request("You cannot delete your own account"));
    }
    let proxy = state.require_db()?;
    auth::revoke_user_sessions(&proxy, state.cache().as_deref(), &id, None).await?;
    if !users::delete_user(&proxy, &id).await? {
        return Err(AppError::not_found("User not found"));
    }
    tracing::info!(user_id = %id, actor_id = %actor.id, "user deleted");
    Ok(ok(serde_json::json!({ "id": id })))
}

/// Loads a user the caller may see, answering 404 otherwise.
async fn visible_user(
    proxy: &DatabaseProxy,
    scope: &AccessScope,
    actor: &AuthUser,
    id: &str,
) -> Result<UserRecord, AppError> {
    let not_found = || AppError::not_found("User not found");
    let record = users::find_user(proxy, id).await?.ok_or_else(not_found)?;
    if record.id == actor.id {
        return Ok(record);
    }
    let visible = match scope {
        AccessScope::All => true,
        AccessScope::Department { department_id } => {
            department_id.is_some() && *department_id == record.department_id
        }
        AccessScope::Teaching { .. } => {
            record.role == Role::Student
                && record.group_id.as_deref().map_or(false, |g| scope.teaches(g))
        }
        AccessScope::Student { .. } => false,
    };
    if visible {
        Ok(record)
    } else {
        Err(not_found())
    }
}

/// Group membership is only for students, and only within their own department.
async fn check_assignment(
    proxy: &DatabaseProxy,
    role: Role,
    department_id: Option<&str>,
    group_id: Option<&str>,
) -> Result<(), AppError> {
    if let Some(department_id) = department_id {
        if crate::db::operations::departments::find_department(proxy, department_id)
            .await?
            .is_none()
        {
            return Err(AppError::validation("Department does not exist"));
        }
    }
    let Some(group_id) = group_id else {
        return Ok(());
    };
    if role != Role::Student {
        return Err(AppError::validation("Only students can be assigned to a group"));
    }
    let group = groups::find_group(proxy, group_id)
        .await?
        .ok_or_else(|| AppError::validation("Group does not exist"))?;
    if Some(group.department_id.as_str()) != department_id {
        return Err(AppError::validation(
            "Group must belong to the student's department",
        ));
    }
    Ok(())
}

/// Cached sessions carry a copy of the user; drop them after the row changes.
async fn invalidate_cached_sessions(
    state: &AppState,
    proxy: &DatabaseProxy,
    user_id: &str,
) -> Result<(), AppError> {
    let Some(cache) = state.cache() else {
        return Ok(());
    };
    let hashes: Vec<String> = sqlx::query_scalar(r#"SELECT "token" FROM "sessions" WHERE "userId" = ?"#)
        .bind(user_id)
        .fetch_all(proxy.pool())
        .await?;
    for hash in hashes {
        cache.delete(&crate::cache::keys::session_key(&hash)).await;
    }
    Ok(())
}
