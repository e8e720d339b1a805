use std::collections::HashSet;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use crate::access::{AccessScope, Role};
use crate::auth::AuthUser;
use crate::db::operations::notices::{self, NewNotice, Notice, NoticeChanges, NoticeReader};
use crate::db::operations::{departments, groups};
use crate::db::{now_ms, parse_iso_ms, DatabaseProxy};
use crate::response::{created, ok, AppError};
use crate::services::notices::{check_expiry, Audience, NoticeError, NoticeTarget, Priority, Recipient};
use crate::state::AppState;

use super::double_option;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_notices).post(create_notice))
        .route("/unread-count", get(unread_count))
        .route("/read-all", post(mark_all_read))
        .route("/:id", get(get_notice).put(update_notice).delete(delete_notice))
        .route("/:id/read", post(mark_read))
        .route("/:id/reads", get(notice_reads))
}

impl From<NoticeError> for AppError {
    fn from(err: NoticeError) -> Self {
        match err {
            NoticeError::NotAllowed(message) => AppError::forbidden(message),
            other => AppError::validation(other.to_string()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    #[serde(default)]
    unread_only: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateNoticeRequest {
    title: String,
    body: String,
    priority: Option<String>,
    target: String,
    target_department_id: Option<String>,
    target_group_id: Option<String>,
    #[serde(default)]
    target_roles: Vec<String>,
    expires_at: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateNoticeRequest {
    title: Option<String>,
    body: Option<String>,
    priority: Option<String>,
    target: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    target_department_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    target_group_id: Option<Option<String>>,
    target_roles: Option<Vec<String>>,
    #[serde(default, deserialize_with = "double_option")]
    expires_at: Option<Option<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadReport {
    notice_id: String,
    audience_size: usize,
    read_count: usize,
    readers: Vec<NoticeReader>,
}

async fn list_notices(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let recipient = recipient_for(&proxy, &user).await?;
    Ok(ok(notices::list_visible(&proxy, &recipient, query.unread_only).await?))
}

async fn unread_count(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let recipient = recipient_for(&proxy, &user).await?;
    let count = notices::unread_count(&proxy, &recipient).await?;
    Ok(ok(serde_json::json!({ "count": count })))
}

async fn mark_all_read(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let recipient = recipient_for(&proxy, &user).await?;
    let marked = notices::mark_all_read(&proxy, &recipient).await?;
    Ok(ok(serde_json::json!({ "marked": marked })))
}

async fn create_notice(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(payload): Json<CreateNoticeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    if scope.is_student() {
        return Err(NoticeError::NotAllowed("Students cannot post notices").into());
    }

    let title = payload.title.trim();
    if title.is_empty() || payload.body.trim().is_empty() {
        return Err(AppError::validation("Notice title and body are required"));
    }
    let priority = parse_priority(payload.priority.as_deref())?.unwrap_or(Priority::Normal);
    let audience = Audience {
        target: parse_target(&payload.target)?,
        department_id: super::non_blank(payload.target_department_id),
        group_id: super::non_blank(payload.target_group_id),
        roles: parse_roles(&payload.target_roles)?,
    }
    .normalized()?;
    check_audience(&proxy, &scope, &audience).await?;

    let now = now_ms();
    let expires_at = parse_expiry(payload.expires_at.as_deref())?;
    check_expiry(expires_at, now)?;

    let notice = notices::insert_notice(
        &proxy,
        NewNotice {
            title: title.to_string(),
            body: payload.body,
            priority,
            audience,
            author_id: user.id.clone(),
            expires_at,
        },
    )
    .await?;
    tracing::info!(
        notice_id = %notice.id,
        target = notice.target.as_str(),
        author_id = %user.id,
        "notice posted"
    );
    Ok(created(notice))
}

async fn get_notice(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let recipient = recipient_for(&proxy, &user).await?;
    Ok(ok(visible_notice(&proxy, &user, &recipient, &id).await?))
}

async fn mark_read(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let recipient = recipient_for(&proxy, &user).await?;
    visible_notice(&proxy, &user, &recipient, &id).await?;

    let newly_read = notices::mark_read(&proxy, &id, &user.id).await?;
    let notice = notices::find_notice(&proxy, &id, &user.id)
        .await?
        .ok_or_else(|| AppError::not_found("Notice not found"))?;
    tracing::debug!(notice_id = %id, user_id = %user.id, newly_read, "notice marked read");
    Ok(ok(notice))
}

async fn update_notice(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateNoticeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    let recipient = Recipient::from_user(&user, &scope);
    let existing = owned_notice(&proxy, &user, &recipient, &id).await?;

    if let Some(title) = &payload.title {
        if title.trim().is_empty() {
            return Err(AppError::validation("Notice title cannot be empty"));
        }
    }
    if let Some(body) = &payload.body {
        if body.trim().is_empty() {
            return Err(AppError::validation("Notice body cannot be empty"));
        }
    }

    let retarget = payload.target.is_some()
        || payload.target_department_id.is_some()
        || payload.target_group_id.is_some()
        || payload.target_roles.is_some();
    let audience = if retarget {
        let current = existing.audience();
        let audience = Audience {
            target: match payload.target.as_deref() {
                Some(target) => parse_target(target)?,
                None => current.target,
            },
            department_id: payload
                .target_department_id
                .map(super::non_blank)
                .unwrap_or(current.department_id),
            group_id: payload
                .target_group_id
                .map(super::non_blank)
                .unwrap_or(current.group_id),
            roles: match &payload.target_roles {
                Some(roles) => parse_roles(roles)?,
                None => current.roles,
            },
        }
        .normalized()?;
        check_audience(&proxy, &scope, &audience).await?;
        Some(audience)
    } else {
        None
    };

    let expires_at = match payload.expires_at {
        Some(value) => {
            let expires_at = parse_expiry(value.as_deref())?;
            check_expiry(expires_at, now_ms())?;
            Some(expires_at)
        }
        None => None,
    };

    let changes = NoticeChanges {
        title: payload.title,
        body: payload.body,
        priority: parse_priority(payload.priority.as_deref())?,
        audience,
        expires_at,
    };
    let notice = notices::update_notice(&proxy, &id, &user.id, changes)
        .await?
        .ok_or_else(|| AppError::not_found("Notice not found"))?;
    Ok(ok(notice))
}

async fn delete_notice(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let recipient = recipient_for(&proxy, &user).await?;
    owned_notice(&proxy, &user, &recipient, &id).await?;
    notices::delete_notice(&proxy, &id).await?;
    tracing::info!(notice_id = %id, actor_id = %user.id, "notice deleted");
    Ok(ok(serde_json::json!({ "id": id })))
}

/// Audience size, read count and readers. Audience size counts active users the
/// notice currently targets.
async fn notice_reads(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let recipient = recipient_for(&proxy, &user).await?;
    let notice = owned_notice(&proxy, &user, &recipient, &id).await?;

    // Readers dropped from the audience by a retarget are not reported.
    let audience = notice.audience();
    let members: HashSet<String> = notices::active_recipients(&proxy)
        .await?
        .into_iter()
        .filter(|r| audience.includes(r))
        .map(|r| r.user_id)
        .collect();
    let readers: Vec<NoticeReader> = notices::readers(&proxy, &id)
        .await?
        .into_iter()
        .filter(|r| members.contains(&r.user_id))
        .collect();
    Ok(ok(ReadReport {
        notice_id: notice.id,
        audience_size: members.len(),
        read_count: readers.len(),
        readers,
    }))
}

async fn recipient_for(proxy: &DatabaseProxy, user: &AuthUser) -> Result<Recipient, AppError> {
    let scope = AccessScope::resolve(proxy, user).await?;
    Ok(Recipient::from_user(user, &scope))
}

/// Admins and the author see any notice; everyone else needs an unexpired notice
/// aimed at them.
async fn visible_notice(
    proxy: &DatabaseProxy,
    user: &AuthUser,
    recipient: &Recipient,
    id: &str,
) -> Result<Notice, AppError> {
    notices::find_notice(proxy, id, &user.id)
        .await?
        .filter(|n| {
            user.role == Role::Admin
                || n.author_id == user.id
                || (!n.is_expired(now_ms()) && n.audience().includes(recipient))
        })
        .ok_or_else(|| AppError::not_found("Notice not found"))
}

async fn owned_notice(
    proxy: &DatabaseProxy,
    user: &AuthUser,
    recipient: &Recipient,
    id: &str,
) -> Result<Notice, AppError> {
    let notice = visible_notice(proxy, user, recipient, id).await?;
    if user.role != Role::Admin && notice.author_id != user.id {
        return Err(AppError::forbidden(
            "Only the author or an administrator can manage this notice",
        ));
    }
    Ok(notice)
}

/// Checks the targeted department or group exists and that the author may address it.
async fn check_audience(
    proxy: &DatabaseProxy,
    scope: &AccessScope,
    audience: &Audience,
) -> Result<(), AppError> {
    if let Some(department_id) = &audience.department_id {
        if departments::find_department(proxy, department_id).await?.is_none() {
            return Err(AppError::validation("Target department does not exist"));
        }
    }
    let group_department = match &audience.group_id {
        Some(group_id) => Some(
            groups::find_group(proxy, group_id)
                .await?
                .ok_or_else(|| AppError::validation("Target group does not exist"))?
                .department_id,
        ),
        None => None,
    };
    audience.check_author(scope, group_department.as_deref())?;
    Ok(())
}

fn parse_target(value: &str) -> Result<NoticeTarget, AppError> {
    NoticeTarget::parse(&value.trim().to_uppercase())
        .ok_or_else(|| AppError::validation("target must be one of ALL, DEPARTMENT, GROUP, ROLES"))
}

fn parse_priority(value: Option<&str>) -> Result<Option<Priority>, AppError> {
    value
        .map(|v| {
            Priority::parse(&v.trim().to_uppercase()).ok_or_else(|| {
                AppError::validation("priority must be one of LOW, NORMAL, HIGH, URGENT")
            })
        })
        .transpose()
}

fn parse_roles(values: &[String]) -> Result<Vec<Role>, AppError> {
    values
        .iter()
        .map(|v| {
            Role::parse(&v.trim().to_uppercase())
                .ok_or_else(|| AppError::validation(format!("Unknown role {v}")))
        })
        .collect()
}

fn parse_expiry(value: Option<&str>) -> Result<Option<i64>, AppError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(value) => parse_iso_ms(value)
            .map(Some)
            .ok_or_else(|| AppError::validation("expiresAt must be an RFC 3339 timestamp")),
    }
}
