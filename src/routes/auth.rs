use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use crate::access::Role;
use crate::auth::{self, AuthUser};
use crate::db::operations::{departments, groups, users};
use crate::db::{now_ms, DatabaseProxy};
use crate::response::{ok, AppError, SuccessResponse};
use crate::state::AppState;

pub fn public_router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
}

pub fn protected_router() -> Router<AppState> {
    Router::new()
        .route("/logout", post(logout))
        .route("/verify", get(verify))
        .route("/refresh", post(refresh))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    email: String,
    password: String,
    username: String,
    role: Option<String>,
    department_id: Option<String>,
    group_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionPayload {
    user: users::UserRecord,
    token: String,
    expires_at: String,
}

async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Response, AppError> {
    let proxy = state.require_db()?;

    if let Some(role) = payload.role.as_deref() {
        if Role::parse(role) != Some(Role::Student) {
            return Err(AppError::forbidden(
                "Self-registration is only available for student accounts",
            ));
        }
    }

    let email = auth::normalize_email(&payload.email)
        .ok_or_else(|| AppError::validation("A valid email address is required"))?;
    auth::check_password_strength(&payload.password).map_err(AppError::validation)?;
    let username = payload.username.trim();
    if username.is_empty() {
        return Err(AppError::validation("Username is required"));
    }

    let department_id = super::non_blank(payload.department_id);
    let group_id = super::non_blank(payload.group_id);
    if let Some(department_id) = &department_id {
        if departments::find_department(&proxy, department_id).await?.is_none() {
            return Err(AppError::validation("Department does not exist"));
        }
    }
    if let Some(group_id) = &group_id {
        let group = groups::find_group(&proxy, group_id)
            .await?
            .ok_or_else(|| AppError::validation("Group does not exist"))?;
        if department_id.as_deref() != Some(group.department_id.as_str()) {
            return Err(AppError::validation(
                "Group must belong to the selected department",
            ));
        }
    }

    if users::email_exists(&proxy, &email).await? {
        return Err(AppError::conflict("Email is already registered").with_code("EMAIL_EXISTS"));
    }

    let password_hash = auth::hash_password(&payload.password)?;
    let user = users::insert_user(
        &proxy,
        users::NewUser {
            email,
            username: username.to_string(),
            password_hash,
            role: Role::Student,
            department_id,
            group_id,
        },
    )
    .await?;

    tracing::info!(user_id = %user.id, "student registered");
    session_response(&proxy, user, StatusCode::CREATED).await
}

async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Response, AppError> {
    let proxy = state.require_db()?;
    let invalid = || AppError::unauthorized("Invalid email or password").with_code("INVALID_CREDENTIALS");

    let Some((user, password_hash)) = users::find_credentials_by_email(&proxy, &payload.email).await?
    else {
        return Err(invalid());
    };
    if !auth::verify_password(&payload.password, &password_hash) {
        tracing::info!(user_id = %user.id, "failed login attempt");
        return Err(invalid());
    }
    if !user.is_active {
        return Err(AppError::forbidden("Account is disabled").with_code("ACCOUNT_DISABLED"));
    }

    tracing::info!(user_id = %user.id, "user logged in");
    session_response(&proxy, user, StatusCode::OK).await
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, AppError> {
    let proxy = state.require_db()?;
    if let Some(token) = auth::extract_token(&headers) {
        let token_hash = auth::hash_token(&token);
        proxy.delete_session_by_token_hash(&token_hash).await?;
        if let Some(cache) = state.cache() {
            cache.delete(&crate::cache::keys::session_key(&token_hash)).await;
        }
    }

    let mut response = ok(serde_json::json!({ "message": "Logged out" })).into_response();
    if let Some(cookie) = auth::clear_auth_cookie_header() {
        response.headers_mut().insert(header::SET_COOKIE, cookie);
    }
    Ok(response)
}

async fn verify(Extension(user): Extension<AuthUser>) -> Json<SuccessResponse<AuthUser>> {
    ok(user)
}

/// Issues a new session and retires the presented one.
async fn refresh(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let proxy = state.require_db()?;
    if let Some(token) = auth::extract_token(&headers) {
        let token_hash = auth::hash_token(&token);
        proxy.delete_session_by_token_hash(&token_hash).await?;
        if let Some(cache) = state.cache() {
            cache.delete(&crate::cache::keys::session_key(&token_hash)).await;
        }
    }

    let record = users::find_user(&proxy, &user.id)
        .await?
        .ok_or_else(|| AppError::unauthorized("Account no longer exists"))?;
    session_response(&proxy, record, StatusCode::OK).await
}

async fn session_response(
    proxy: &DatabaseProxy,
    user: users::UserRecord,
    status: StatusCode,
) -> Result<Response, AppError> {
    let (token, expires_at) = auth::issue_session(proxy, &user.id).await?;
    let max_age_secs = (expires_at - now_ms()) / 1000;

    let mut response = (
        status,
        Json(SuccessResponse {
            success: true,
            data: SessionPayload {
                user,
                token: token.clone(),
                expires_at: crate::db::format_ms_iso(expires_at),
            },
        }),
    )
        .into_response();
    if let Some(cookie) = auth::auth_cookie_header(&token, max_age_secs) {
        response.headers_mut().insert(header::SET_COOKIE, cookie);
    }
    Ok(response)
}
