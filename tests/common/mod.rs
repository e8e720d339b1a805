#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use lms_backend_rust::access::Role;
use lms_backend_rust::auth;
use lms_backend_rust::config::Config;
use lms_backend_rust::db::operations::users::{self, NewUser};
use lms_backend_rust::db::DatabaseProxy;
use lms_backend_rust::state::AppState;

pub const PASSWORD: &str = "Passw0rd!";

pub fn init_env() {
    std::env::set_var("APP_ENV", "test");
    std::env::set_var("JWT_SECRET", "integration-test-secret");
    std::env::set_var("JWT_EXPIRES_IN", "1h");
}

#[derive(Clone)]
pub struct TestApp {
    pub app: Router,
    pub proxy: Arc<DatabaseProxy>,
}

/// A signed-in account.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub token: String,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_url("sqlite::memory:").await
    }

    pub async fn with_url(url: &str) -> Self {
        Self::with_pool(url, 1).await
    }

    pub async fn with_pool(url: &str, max_connections: u32) -> Self {
        init_env();
        let proxy = Arc::new(
            DatabaseProxy::connect(url, max_connections)
                .await
                .expect("open test database"),
        );
        let state = AppState::new(Config::from_env(), Some(Arc::clone(&proxy)), None);
        Self {
            app: lms_backend_rust::build_app(state),
            proxy,
        }
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    pub async fn get(&self, uri: &str, token: &str) -> (StatusCode, Value) {
        self.request(Method::GET, uri, Some(token), None).await
    }

    pub async fn post(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
        self.request(Method::POST, uri, Some(token), Some(body)).await
    }

    pub async fn put(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
        self.request(Method::PUT, uri, Some(token), Some(body)).await
    }

    pub async fn delete(&self, uri: &str, token: &str) -> (StatusCode, Value) {
        self.request(Method::DELETE, uri, Some(token), None).await
    }

    /// Inserts an account directly and opens a session for it.
    pub async fn account(
        &self,
        role: Role,
        email: &str,
        department_id: Option<&str>,
        group_id: Option<&str>,
    ) -> Account {
        let user = users::insert_user(
            &self.proxy,
            NewUser {
                email: email.to_string(),
                username: email.split('@').next().unwrap_or(email).to_string(),
                password_hash: auth::hash_password(PASSWORD).unwrap(),
                role,
                department_id: department_id.map(str::to_string),
                group_id: group_id.map(str::to_string),
            },
        )
        .await
        .unwrap();
        let (token, _) = auth::issue_session(&self.proxy, &user.id).await.unwrap();
        Account { id: user.id, token }
    }

    pub async fn admin(&self) -> Account {
        self.account(Role::Admin, "admin@school.test", None, None).await
    }

    pub async fn department(&self, admin: &Account, name: &str, code: &str) -> String {
        let (status, body) = self
            .post(
                "/api/departments",
                &admin.token,
                json!({ "name": name, "code": code }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        id_of(&body)
    }

    pub async fn group(
        &self,
        admin: &Account,
        department_id: &str,
        name: &str,
        teacher_id: Option<&str>,
    ) -> String {
        let (status, body) = self
            .post(
                "/api/groups",
                &admin.token,
                json!({ "name": name, "departmentId": department_id, "teacherId": teacher_id }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        id_of(&body)
    }

    pub async fn module(&self, author: &Account, department_id: &str, title: &str, order: i64) -> String {
        let (status, body) = self
            .post(
                "/api/modules",
                &author.token,
                json!({
                    "title": title,
                    "departmentId": department_id,
                    "orderIndex": order,
                    "isPublished": true,
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        id_of(&body)
    }

    pub async fn mcq(&self, author: &Account, module_id: &str, answer: &str, marks: i64) -> String {
        let (status, body) = self
            .post(
                &format!("/api/modules/{module_id}/questions"),
                &author.token,
                json!({
                    "prompt": format!("Pick {answer}"),
                    "kind": "MCQ",
                    "options": ["a", "b", "c"],
                    "correctAnswer": answer,
                    "marks": marks,
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        id_of(&body)
    }

    pub async fn assessment(
        &self,
        author: &Account,
        module_id: &str,
        question_ids: &[String],
        extra: Value,
    ) -> String {
        let mut payload = json!({
            "title": "Quiz",
            "moduleId": module_id,
            "questionIds": question_ids,
            "isPublished": true,
        });
        if let (Some(target), Some(extra)) = (payload.as_object_mut(), extra.as_object()) {
            for (key, value) in extra {
                target.insert(key.clone(), value.clone());
            }
        }
        let (status, body) = self.post("/api/assessments", &author.token, payload).await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        id_of(&body)
    }
}

pub fn id_of(body: &Value) -> String {
    body["data"]["id"]
        .as_str()
        .unwrap_or_else(|| panic!("no id in {body}"))
        .to_string()
}

pub fn ids_in(body: &Value) -> Vec<String> {
    body["data"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item["id"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
