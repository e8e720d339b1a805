use axum::http::StatusCode;
use serde_json::json;

mod common;

use common::{ids_in, TestApp};
use lms_backend_rust::access::Role;

async fn set_prerequisites(
    app: &TestApp,
    token: &str,
    module: &str,
    prerequisites: &[&str],
) -> (StatusCode, serde_json::Value) {
    app.put(
        &format!("/api/modules/{module}/prerequisites"),
        token,
        json!({ "prerequisiteIds": prerequisites }),
    )
    .await
}

#[tokio::test]
async fn cycles_and_self_references_are_rejected() {
    let app = TestApp::new().await;
    let admin = app.admin().await;
    let dept = app.department(&admin, "Science", "SCI").await;
    let a = app.module(&admin, &dept, "A", 1).await;
    let b = app.module(&admin, &dept, "B", 2).await;
    let c = app.module(&admin, &dept, "C", 3).await;

    let (status, body) = set_prerequisites(&app, &admin.token, &b, &[&a]).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["prerequisiteIds"], json!([a]));
    let (status, _) = set_prerequisites(&app, &admin.token, &c, &[&b]).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = set_prerequisites(&app, &admin.token, &a, &[&c]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "CIRCULAR_PREREQUISITE");

    let (status, body) = set_prerequisites(&app, &admin.token, &a, &[&a]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "CIRCULAR_PREREQUISITE");

    // The rejected change left the stored edges alone.
    let (_, body) = app.get(&format!("/api/modules/{a}"), &admin.token).await;
    assert_eq!(body["data"]["prerequisiteIds"], json!([]));

    let (status, _) = set_prerequisites(&app, &admin.token, &a, &["missing"]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn prerequisites_stay_inside_one_department() {
    let app = TestApp::new().await;
    let admin = app.admin().await;
    let science = app.department(&admin, "Science", "SCI").await;
    let arts = app.department(&admin, "Arts", "ART").await;
    let physics = app.module(&admin, &science, "Physics", 1).await;
    let drawing = app.module(&admin, &arts, "Drawing", 1).await;

    let (status, body) = app
        .put(
            &format!("/api/modules/{physics}/prerequisites"),
            &admin.token,
            json!({ "prerequisiteIds": [drawing] }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn order_follows_prerequisites_then_order_index() {
    let app = TestApp::new().await;
    let admin = app.admin().await;
    let dept = app.department(&admin, "Science", "SCI").await;
    let teacher = app
        .account(Role::Teacher, "t@school.test", Some(&dept), None)
        .await;
    let advanced = app.module(&teacher, &dept, "Advanced", 1).await;
    let basics = app.module(&teacher, &dept, "Basics", 2).await;
    let extra = app.module(&teacher, &dept, "Extra", 3).await;

    let (status, _) = app
        .put(
            &format!("/api/modules/{advanced}/prerequisites"),
            &teacher.token,
            json!({ "prerequisiteIds": [basics] }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.get("/api/modules/order", &teacher.token).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(ids_in(&body), vec![basics, advanced, extra]);
}

#[tokio::test]
async fn students_unlock_modules_by_passing_prerequisites() {
    let app = TestApp::new().await;
    let admin = app.admin().await;
    let dept = app.department(&admin, "Science", "SCI").await;
    let teacher = app
        .account(Role::Teacher, "t@school.test", Some(&dept), None)
        .await;
    let student = app
        .account(Role::Student, "s@school.test", Some(&dept), None)
        .await;

    let intro = app.module(&teacher, &dept, "Intro", 1).await;
    let next = app.module(&teacher, &dept, "Next", 2).await;
    let (status, _) = app
        .put(
            &format!("/api/modules/{next}/prerequisites"),
            &teacher.token,
            json!({ "prerequisiteIds": [intro] }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    // Without a published assessment the prerequisite does not block.
    let (status, body) = app
        .get(&format!("/api/modules/{next}/status"), &student.token)
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["unlocked"], true);
    assert_eq!(body["data"]["prerequisites"][0]["hasAssessments"], false);

    let q1 = app.mcq(&teacher, &intro, "a", 1).await;
    let q2 = app.mcq(&teacher, &intro, "b", 1).await;
    let quiz = app
        .assessment(&teacher, &intro, &[q1.clone(), q2.clone()], json!({ "maxAttempts": 3 }))
        .await;

    let (_, body) = app
        .get(&format!("/api/modules/{next}/status"), &student.token)
        .await;
    assert_eq!(body["data"]["unlocked"], false);
    assert_eq!(body["data"]["blocking"], json!([intro.clone()]));
    assert_eq!(body["data"]["prerequisites"][0]["title"], "Intro");
    assert!(body["data"]["prerequisites"][0]["bestPercentage"].is_null());

    let (status, _) = app
        .post(
            &format!("/api/assessments/{quiz}/submit"),
            &student.token,
            json!({ "answers": { q1.as_str(): "c", q2.as_str(): "c" } }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let (_, body) = app
        .get(&format!("/api/modules/{next}/status"), &student.token)
        .await;
    assert_eq!(body["data"]["unlocked"], false);
    assert_eq!(body["data"]["prerequisites"][0]["bestPercentage"], 0.0);

    // Half marks meet the threshold.
    let (status, _) = app
        .post(
            &format!("/api/assessments/{quiz}/submit"),
            &student.token,
            json!({ "answers": { q1.as_str(): "a", q2.as_str(): "c" } }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let (_, body) = app
        .get(&format!("/api/modules/{next}/status"), &student.token)
        .await;
    assert_eq!(body["data"]["unlocked"], true);
    assert_eq!(body["data"]["passThreshold"], 50.0);
    assert_eq!(body["data"]["blocking"], json!([]));

    let (status, _) = app
        .get(&format!("/api/modules/{next}/status"), &teacher.token)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn students_see_published_content_without_answers() {
    let app = TestApp::new().await;
    let admin = app.admin().await;
    let dept = app.department(&admin, "Science", "SCI").await;
    let teacher = app
        .account(Role::Teacher, "t@school.test", Some(&dept), None)
        .await;
    let student = app
        .account(Role::Student, "s@school.test", Some(&dept), None)
        .await;

    let published = app.module(&teacher, &dept, "Published", 1).await;
    app.mcq(&teacher, &published, "b", 2).await;
    let (status, body) = app
        .post(
            "/api/modules",
            &teacher.token,
            json!({ "title": "Draft", "departmentId": dept }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let draft = body["data"]["id"].as_str().unwrap().to_string();

    let (_, body) = app.get("/api/modules", &student.token).await;
    assert_eq!(ids_in(&body), vec![published.clone()]);
    let (status, _) = app.get(&format!("/api/modules/{draft}"), &student.token).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = app
        .get(&format!("/api/modules/{published}/questions"), &student.token)
        .await;
    assert_eq!(status, StatusCode::OK);
    let question = &body["data"][0];
    assert_eq!(question["marks"], 2);
    assert!(question.get("correctAnswer").is_none());

    let (_, body) = app
        .get(&format!("/api/modules/{published}/questions"), &teacher.token)
        .await;
    assert_eq!(body["data"][0]["correctAnswer"], "b");

    let (status, _) = app
        .post(
            "/api/modules",
            &student.token,
            json!({ "title": "Mine", "departmentId": dept }),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn invalid_questions_are_rejected() {
    let app = TestApp::new().await;
    let admin = app.admin().await;
    let dept = app.department(&admin, "Science", "SCI").await;
    let module = app.module(&admin, &dept, "M", 1).await;
    let uri = format!("/api/modules/{module}/questions");

    let (status, body) = app
        .post(
            &uri,
            &admin.token,
            json!({ "prompt": "?", "kind": "MCQ", "options": ["a", "b"], "correctAnswer": "z" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let (status, body) = app
        .post(
            &uri,
            &admin.token,
            json!({ "prompt": "Sky is blue", "kind": "true_false", "correctAnswer": "TRUE" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["data"]["options"], json!(["true", "false"]));
    assert_eq!(body["data"]["correctAnswer"], "true");
    assert_eq!(body["data"]["difficulty"], "MEDIUM");
}

#[tokio::test]
async fn prerequisite_assessments_for_other_groups_do_not_lock() {
    let app = TestApp::new().await;
    let admin = app.admin().await;
    let dept = app.department(&admin, "Science", "SCI").await;
    let g1 = app.group(&admin, &dept, "G1", None).await;
    let g2 = app.group(&admin, &dept, "G2", None).await;
    let student = app
        .account(Role::Student, "s@school.test", Some(&dept), Some(&g1))
        .await;

    let basics = app.module(&admin, &dept, "Basics", 1).await;
    let advanced = app.module(&admin, &dept, "Advanced", 2).await;
    let (status, _) = set_prerequisites(&app, &admin.token, &advanced, &[&basics]).await;
    assert_eq!(status, StatusCode::OK);

    let question = app.mcq(&admin, &basics, "a", 1).await;
    app.assessment(&admin, &basics, &[question.clone()], json!({ "groupId": g2 }))
        .await;

    let (_, body) = app
        .get(&format!("/api/assessments?moduleId={basics}"), &student.token)
        .await;
    assert!(ids_in(&body).is_empty());
    let (status, body) = app
        .get(&format!("/api/modules/{advanced}/status"), &student.token)
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["unlocked"], true);
    assert_eq!(body["data"]["prerequisites"][0]["hasAssessments"], false);

    app.assessment(&admin, &basics, &[question], json!({ "groupId": g1 }))
        .await;
    let (_, body) = app
        .get(&format!("/api/modules/{advanced}/status"), &student.token)
        .await;
    assert_eq!(body["data"]["unlocked"], false);
    assert_eq!(body["data"]["prerequisites"][0]["hasAssessments"], true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_replacements_cannot_form_a_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("lms.db").display());
    let app = TestApp::with_pool(&url, 8).await;
    let admin = app.admin().await;
    let dept = app.department(&admin, "Science", "SCI").await;
    let a = app.module(&admin, &dept, "A", 1).await;
    let b = app.module(&admin, &dept, "B", 2).await;

    let first = {
        let (app, token, a, b) = (app.clone(), admin.token.clone(), a.clone(), b.clone());
        tokio::spawn(async move { set_prerequisites(&app, &token, &a, &[&b]).await })
    };
    let second = {
        let (app, token, a, b) = (app.clone(), admin.token.clone(), a.clone(), b.clone());
        tokio::spawn(async move { set_prerequisites(&app, &token, &b, &[&a]).await })
    };
    let mut results = vec![first.await.unwrap(), second.await.unwrap()];
    results.sort_by_key(|(status, _)| status.as_u16());

    assert_eq!(results[0].0, StatusCode::OK, "{}", results[0].1);
    assert_eq!(results[1].0, StatusCode::BAD_REQUEST, "{}", results[1].1);
    assert_eq!(results[1].1["code"], "CIRCULAR_PREREQUISITE");

    let (status, body) = app
        .get(&format!("/api/modules/order?departmentId={dept}"), &admin.token)
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(ids_in(&body).len(), 2);
}
