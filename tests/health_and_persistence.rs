use axum::http::{Method, StatusCode};
use serde_json::json;

mod common;

use common::TestApp;
use lms_backend_rust::config::Config;
use lms_backend_rust::state::AppState;

#[tokio::test]
async fn health_endpoints_report_a_connected_database() {
    let app = TestApp::new().await;

    let (status, body) = app.request(Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["database"], "connected");

    let (status, body) = app.request(Method::GET, "/health/live", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = app.request(Method::GET, "/health/ready", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["cache"], "disabled");

    let (status, body) = app.request(Method::GET, "/health/info", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "lms-backend");
    assert_eq!(body["environment"], "test");
}

#[tokio::test]
async fn missing_database_answers_503() {
    common::init_env();
    let app = TestApp {
        app: lms_backend_rust::build_app(AppState::new(Config::from_env(), None, None)),
        proxy: TestApp::new().await.proxy,
    };

    let (status, body) = app.request(Method::GET, "/health/ready", None, None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");

    let (status, body) = app
        .request(
            Method::POST,
            "/api/auth/login",
            None,
            Some(json!({ "email": "a@b.test", "password": "whatever1" })),
        )
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "SERVICE_UNAVAILABLE");

    let (status, _) = app.get("/api/users/me", "some.token.value").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn data_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("lms.db").display());

    let department = {
        let app = TestApp::with_url(&url).await;
        let admin = app.admin().await;
        let department = app.department(&admin, "Science", "SCI").await;
        app.proxy.close().await;
        department
    };

    let app = TestApp::with_url(&url).await;
    let (status, body) = app
        .request(
            Method::POST,
            "/api/auth/login",
            None,
            Some(json!({ "email": "admin@school.test", "password": common::PASSWORD })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let token = body["data"]["token"].as_str().unwrap().to_string();

    let (status, body) = app.get(&format!("/api/departments/{department}"), &token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["name"], "Science");
}
