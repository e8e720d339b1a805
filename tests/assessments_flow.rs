use axum::http::StatusCode;
use serde_json::json;
use tokio::task::JoinSet;

mod common;

use common::{ids_in, Account, TestApp};
use lms_backend_rust::access::Role;

struct Course {
    teacher: Account,
    student: Account,
    dept: String,
    module: String,
    questions: Vec<String>,
}

/// A published module with three questions worth 1, 2 and 1 marks.
async fn course(app: &TestApp) -> Course {
    let admin = app.admin().await;
    let dept = app.department(&admin, "Science", "SCI").await;
    let teacher = app
        .account(Role::Teacher, "teacher@school.test", Some(&dept), None)
        .await;
    let student = app
        .account(Role::Student, "student@school.test", Some(&dept), None)
        .await;
    let module = app.module(&teacher, &dept, "Optics", 1).await;

    let mcq = app.mcq(&teacher, &module, "b", 1).await;
    let (status, body) = app
        .post(
            &format!("/api/modules/{module}/questions"),
            &teacher.token,
            json!({ "prompt": "Light is a wave", "kind": "TRUE_FALSE", "correctAnswer": "true", "marks": 2 }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let true_false = common::id_of(&body);
    let (status, body) = app
        .post(
            &format!("/api/modules/{module}/questions"),
            &teacher.token,
            json!({ "prompt": "Name the bending of light", "kind": "SHORT", "correctAnswer": "Refraction" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let short = common::id_of(&body);

    Course {
        teacher,
        student,
        dept,
        module,
        questions: vec![mcq, true_false, short],
    }
}

#[tokio::test]
async fn submissions_are_graded_per_question() {
    let app = TestApp::new().await;
    let course = course(&app).await;
    let quiz = app
        .assessment(&course.teacher, &course.module, &course.questions, json!({ "maxAttempts": 2 }))
        .await;

    let (status, body) = app.get(&format!("/api/assessments/{quiz}"), &course.student.token).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["totalMarks"], 4);
    let questions = body["data"]["questions"].as_array().unwrap();
    assert_eq!(questions.len(), 3);
    assert!(questions.iter().all(|q| q.get("correctAnswer").is_none()));

    let [mcq, true_false, short] = [
        course.questions[0].as_str(),
        course.questions[1].as_str(),
        course.questions[2].as_str(),
    ];
    let (status, body) = app
        .post(
            &format!("/api/assessments/{quiz}/submit"),
            &course.student.token,
            json!({ "answers": { mcq: "a", true_false: true, short: "  refraction " } }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let data = &body["data"];
    assert_eq!(data["submission"]["score"], 3);
    assert_eq!(data["submission"]["maxScore"], 4);
    assert_eq!(data["submission"]["percentage"], 75.0);
    assert_eq!(data["submission"]["attempt"], 1);
    assert_eq!(data["attemptsRemaining"], 1);
    assert_eq!(data["results"][0]["correct"], false);
    assert_eq!(data["results"][1]["awarded"], 2);
    assert_eq!(data["results"][2]["correct"], true);

    let (status, body) = app
        .get(&format!("/api/assessments/{quiz}/submissions"), &course.student.token)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn attempts_are_limited() {
    let app = TestApp::new().await;
    let course = course(&app).await;
    let quiz = app
        .assessment(&course.teacher, &course.module, &course.questions[..1], json!({}))
        .await;
    let uri = format!("/api/assessments/{quiz}/submit");

    let (status, body) = app.post(&uri, &course.student.token, json!({ "answers": {} })).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["submission"]["score"], 0);
    assert_eq!(body["data"]["attemptsRemaining"], 0);

    let (status, body) = app.post(&uri, &course.student.token, json!({ "answers": {} })).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "ATTEMPTS_EXHAUSTED");

    let (status, _) = app.post(&uri, &course.teacher.token, json!({ "answers": {} })).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn closed_and_unpublished_assessments() {
    let app = TestApp::new().await;
    let course = course(&app).await;

    let overdue = app
        .assessment(
            &course.teacher,
            &course.module,
            &course.questions,
            json!({ "dueAt": "2020-01-01T00:00:00Z" }),
        )
        .await;
    let (status, body) = app
        .post(
            &format!("/api/assessments/{overdue}/submit"),
            &course.student.token,
            json!({ "answers": {} }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "ASSESSMENT_CLOSED");

    let draft = app
        .assessment(
            &course.teacher,
            &course.module,
            &course.questions,
            json!({ "title": "Draft", "isPublished": false }),
        )
        .await;
    let (status, _) = app.get(&format!("/api/assessments/{draft}"), &course.student.token).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (_, body) = app.get("/api/assessments", &course.student.token).await;
    assert_eq!(ids_in(&body), vec![overdue.clone()]);

    let (status, body) = app
        .put(
            &format!("/api/assessments/{draft}"),
            &course.teacher.token,
            json!({ "isPublished": true }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let (status, _) = app.get(&format!("/api/assessments/{draft}"), &course.student.token).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn assessments_only_use_questions_from_their_module() {
    let app = TestApp::new().await;
    let course = course(&app).await;
    let other = app.module(&course.teacher, &course.dept, "Other", 2).await;
    let foreign = app.mcq(&course.teacher, &other, "a", 1).await;

    let (status, body) = app
        .post(
            "/api/assessments",
            &course.teacher.token,
            json!({ "title": "Mixed", "moduleId": course.module, "questionIds": [course.questions[0], foreign] }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

    let (status, _) = app
        .post(
            "/api/assessments",
            &course.teacher.token,
            json!({ "title": "Empty", "moduleId": course.module, "questionIds": [] }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .post(
            "/api/assessments",
            &course.teacher.token,
            json!({ "title": "Zero", "moduleId": course.module, "questionIds": [course.questions[0]], "maxAttempts": 0 }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stats_and_student_metrics_follow_submissions() {
    let app = TestApp::new().await;
    let course = course(&app).await;
    let quiz = app
        .assessment(&course.teacher, &course.module, &course.questions[..1], json!({ "maxAttempts": 3 }))
        .await;
    let mcq = course.questions[0].as_str();
    let uri = format!("/api/assessments/{quiz}/submit");

    for answer in ["a", "b"] {
        let (status, _) = app
            .post(&uri, &course.student.token, json!({ "answers": { mcq: answer } }))
            .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, body) = app.get(&format!("/api/assessments/{quiz}/stats"), &course.teacher.token).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let stats = &body["data"];
    assert_eq!(stats["count"], 2);
    assert_eq!(stats["mean"], 50.0);
    assert_eq!(stats["min"], 0.0);
    assert_eq!(stats["max"], 100.0);
    assert_eq!(stats["passRate"], 50.0);
    assert_eq!(stats["distribution"][0]["count"], 1);
    assert_eq!(stats["distribution"][9]["count"], 1);

    let (status, _) = app.get(&format!("/api/assessments/{quiz}/stats"), &course.student.token).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app.get("/api/analytics/me", &course.student.token).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let metric = &body["data"]["metric"];
    assert_eq!(metric["totalSubmissions"], 2);
    assert_eq!(metric["averagePercentage"], 50.0);
    assert_eq!(metric["bestPercentage"], 100.0);
    assert_eq!(metric["currentStreak"], 1);
    assert_eq!(body["data"]["modules"][0]["moduleTitle"], "Optics");
    assert_eq!(body["data"]["modules"][0]["attempts"], 2);
    assert_eq!(body["data"]["recentSubmissions"].as_array().unwrap().len(), 2);

    let (status, body) = app
        .get(&format!("/api/analytics/students/{}", course.student.id), &course.teacher.token)
        .await;
    // The student is in no group this teacher teaches.
    assert_eq!(status, StatusCode::NOT_FOUND, "{body}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_cannot_exceed_the_attempt_limit() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("lms.db").display());
    let app = TestApp::with_pool(&url, 8).await;
    let course = course(&app).await;
    let quiz = app
        .assessment(&course.teacher, &course.module, &course.questions[..1], json!({}))
        .await;
    let uri = format!("/api/assessments/{quiz}/submit");

    let mut tasks = JoinSet::new();
    for _ in 0..8 {
        let app = app.clone();
        let uri = uri.clone();
        let token = course.student.token.clone();
        tasks.spawn(async move { app.post(&uri, &token, json!({ "answers": {} })).await.0 });
    }
    let mut statuses = Vec::new();
    while let Some(status) = tasks.join_next().await {
        statuses.push(status.unwrap());
    }

    let created = statuses.iter().filter(|s| **s == StatusCode::CREATED).count();
    assert_eq!(created, 1, "{statuses:?}");
    assert!(
        statuses
            .iter()
            .all(|s| *s == StatusCode::CREATED || *s == StatusCode::CONFLICT),
        "{statuses:?}"
    );

    let stored: i64 =
        sqlx::query_scalar(r#"SELECT COUNT(*) FROM "submissions" WHERE "assessmentId" = ?"#)
            .bind(&quiz)
            .fetch_one(app.proxy.pool())
            .await
            .unwrap();
    assert_eq!(stored, 1);
}

#[tokio::test]
async fn deleting_graded_work_refreshes_student_metrics() {
    let app = TestApp::new().await;
    let course = course(&app).await;
    let quiz = app
        .assessment(&course.teacher, &course.module, &course.questions[..1], json!({}))
        .await;
    let mcq = course.questions[0].as_str();
    let (status, _) = app
        .post(
            &format!("/api/assessments/{quiz}/submit"),
            &course.student.token,
            json!({ "answers": { mcq: "b" } }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let other = app.module(&course.teacher, &course.dept, "Waves", 2).await;
    let question = app.mcq(&course.teacher, &other, "a", 1).await;
    let wave_quiz = app
        .assessment(&course.teacher, &other, &[question.clone()], json!({}))
        .await;
    let (status, _) = app
        .post(
            &format!("/api/assessments/{wave_quiz}/submit"),
            &course.student.token,
            json!({ "answers": { question.as_str(): "c" } }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (_, body) = app.get("/api/analytics/me", &course.student.token).await;
    assert_eq!(body["data"]["metric"]["totalSubmissions"], 2);
    assert_eq!(body["data"]["metric"]["averagePercentage"], 50.0);

    let (status, _) = app.delete(&format!("/api/assessments/{quiz}"), &course.teacher.token).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = app.get("/api/analytics/me", &course.student.token).await;
    let metric = &body["data"]["metric"];
    assert_eq!(metric["totalSubmissions"], 1);
    assert_eq!(metric["averagePercentage"], 0.0);
    assert_eq!(metric["bestPercentage"], 0.0);
    assert_eq!(body["data"]["recentSubmissions"].as_array().unwrap().len(), 1);

    let (status, _) = app.delete(&format!("/api/modules/{other}"), &course.teacher.token).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = app.get("/api/analytics/me", &course.student.token).await;
    assert_eq!(body["data"]["metric"]["totalSubmissions"], 0);
    assert!(body["data"]["recentSubmissions"].as_array().unwrap().is_empty());
}
