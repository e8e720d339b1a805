use axum::http::StatusCode;
use serde_json::json;

mod common;

use common::{ids_in, TestApp};
use lms_backend_rust::access::Role;

#[tokio::test]
async fn departments_are_admin_managed_and_scoped_for_hods() {
    let app = TestApp::new().await;
    let admin = app.admin().await;
    let science = app.department(&admin, "Science", "sci").await;
    let arts = app.department(&admin, "Arts", "ART").await;

    let (status, body) = app
        .post("/api/departments", &admin.token, json!({ "name": "Other", "code": "SCI" }))
        .await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");

    let hod = app.account(Role::Hod, "hod@school.test", None, None).await;
    let (status, body) = app
        .put(
            &format!("/api/departments/{science}"),
            &admin.token,
            json!({ "hodId": hod.id }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["code"], "SCI");

    // Appointment moved the HOD into the department.
    let (_, me) = app.get("/api/users/me", &hod.token).await;
    assert_eq!(me["data"]["departmentId"], science.as_str());

    let (status, body) = app.get("/api/departments", &hod.token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ids_in(&body), vec![science.clone()]);

    let (status, _) = app.get(&format!("/api/departments/{arts}"), &hod.token).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app
        .post("/api/departments", &hod.token, json!({ "name": "Music", "code": "MUS" }))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .put(
            &format!("/api/departments/{science}"),
            &hod.token,
            json!({ "name": "Renamed" }),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .put(
            &format!("/api/departments/{science}"),
            &hod.token,
            json!({ "description": "Physics and chemistry" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["description"], "Physics and chemistry");
}

#[tokio::test]
async fn departments_in_use_cannot_be_deleted() {
    let app = TestApp::new().await;
    let admin = app.admin().await;
    let dept = app.department(&admin, "Science", "SCI").await;
    let empty = app.department(&admin, "Empty", "EMP").await;
    app.group(&admin, &dept, "Year 1", None).await;

    let (status, body) = app.delete(&format!("/api/departments/{dept}"), &admin.token).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "DEPARTMENT_IN_USE");

    let (status, _) = app.delete(&format!("/api/departments/{empty}"), &admin.token).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn groups_require_teachers_from_the_same_department() {
    let app = TestApp::new().await;
    let admin = app.admin().await;
    let science = app.department(&admin, "Science", "SCI").await;
    let arts = app.department(&admin, "Arts", "ART").await;
    let art_teacher = app
        .account(Role::Teacher, "artist@school.test", Some(&arts), None)
        .await;
    let student = app
        .account(Role::Student, "stu@school.test", Some(&science), None)
        .await;

    let (status, body) = app
        .post(
            "/api/groups",
            &admin.token,
            json!({ "name": "G1", "departmentId": science, "teacherId": art_teacher.id }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

    let (status, _) = app
        .post(
            "/api/groups",
            &admin.token,
            json!({ "name": "G1", "departmentId": science, "teacherId": student.id }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn group_membership() {
    let app = TestApp::new().await;
    let admin = app.admin().await;
    let science = app.department(&admin, "Science", "SCI").await;
    let arts = app.department(&admin, "Arts", "ART").await;
    let teacher = app
        .account(Role::Teacher, "teach@school.test", Some(&science), None)
        .await;
    let group = app.group(&admin, &science, "Year 1", Some(&teacher.id)).await;
    let s1 = app.account(Role::Student, "s1@school.test", Some(&science), None).await;
    let s2 = app.account(Role::Student, "s2@school.test", Some(&science), None).await;
    let outsider = app.account(Role::Student, "s3@school.test", Some(&arts), None).await;

    let (status, body) = app
        .post(
            &format!("/api/groups/{group}/members"),
            &admin.token,
            json!({ "userIds": [s1.id, outsider.id] }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

    let (status, body) = app
        .post(
            &format!("/api/groups/{group}/members"),
            &admin.token,
            json!({ "userIds": [s1.id, s2.id] }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"].as_array().unwrap().len(), 2);

    let (status, body) = app.get(&format!("/api/groups/{group}"), &admin.token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["memberCount"], 2);

    // Teachers only list the students of groups they teach.
    let (status, body) = app.get("/api/users", &teacher.token).await;
    assert_eq!(status, StatusCode::OK);
    let mut listed = ids_in(&body);
    listed.sort();
    let mut expected = vec![s1.id.clone(), s2.id.clone()];
    expected.sort();
    assert_eq!(listed, expected);
    assert_eq!(body["total"], 2);

    let (status, _) = app
        .delete(&format!("/api/groups/{group}/members/{}", s2.id), &admin.token)
        .await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = app.get(&format!("/api/groups/{group}/members"), &teacher.token).await;
    assert_eq!(ids_in(&body), vec![s1.id.clone()]);

    let (status, _) = app.get(&format!("/api/groups/{group}/members"), &s1.token).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn hods_manage_users_inside_their_department_only() {
    let app = TestApp::new().await;
    let admin = app.admin().await;
    let science = app.department(&admin, "Science", "SCI").await;
    let arts = app.department(&admin, "Arts", "ART").await;
    let hod = app.account(Role::Hod, "hod@school.test", Some(&science), None).await;

    let (status, body) = app
        .post(
            "/api/users",
            &hod.token,
            json!({
                "email": "new.teacher@school.test",
                "password": "secret123",
                "username": "newt",
                "role": "TEACHER",
                "departmentId": science,
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");

    let (status, _) = app
        .post(
            "/api/users",
            &hod.token,
            json!({
                "email": "other@school.test",
                "password": "secret123",
                "username": "other",
                "role": "TEACHER",
                "departmentId": arts,
            }),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .post(
            "/api/users",
            &hod.token,
            json!({
                "email": "boss@school.test",
                "password": "secret123",
                "username": "boss",
                "role": "ADMIN",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let foreign = app.account(Role::Student, "f@school.test", Some(&arts), None).await;
    let (status, _) = app.get(&format!("/api/users/{}", foreign.id), &hod.token).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app.delete(&format!("/api/users/{}", admin.id), &admin.token).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn role_and_department_changes_release_group_and_department_links() {
    let app = TestApp::new().await;
    let admin = app.admin().await;
    let science = app.department(&admin, "Science", "SCI").await;
    let arts = app.department(&admin, "Arts", "ART").await;
    let teacher = app
        .account(Role::Teacher, "teacher@school.test", Some(&science), None)
        .await;
    let group = app.group(&admin, &science, "Year 1", Some(&teacher.id)).await;

    let (status, body) = app
        .put(
            &format!("/api/users/{}", teacher.id),
            &admin.token,
            json!({ "departmentId": arts }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let (_, body) = app.get(&format!("/api/groups/{group}"), &admin.token).await;
    assert!(body["data"]["teacherId"].is_null(), "{body}");
    let (status, _) = app
        .post(
            "/api/notices",
            &teacher.token,
            json!({ "title": "T", "body": "B", "target": "GROUP", "targetGroupId": group }),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let hod = app.account(Role::Hod, "hod@school.test", Some(&science), None).await;
    let (status, body) = app
        .put(&format!("/api/departments/{science}"), &admin.token, json!({ "hodId": hod.id }))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let (status, _) = app
        .put(&format!("/api/users/{}", hod.id), &admin.token, json!({ "role": "TEACHER" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = app.get(&format!("/api/departments/{science}"), &admin.token).await;
    assert!(body["data"]["hodId"].is_null(), "{body}");

    // Appointing a sitting HOD elsewhere vacates their old department.
    let head = app.account(Role::Hod, "head@school.test", Some(&science), None).await;
    let (status, _) = app
        .put(&format!("/api/departments/{science}"), &admin.token, json!({ "hodId": head.id }))
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = app
        .put(&format!("/api/departments/{arts}"), &admin.token, json!({ "hodId": head.id }))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["hodId"], head.id.as_str());
    let (_, body) = app.get(&format!("/api/departments/{science}"), &admin.token).await;
    assert!(body["data"]["hodId"].is_null(), "{body}");
    let (_, body) = app.get(&format!("/api/users/{}", head.id), &admin.token).await;
    assert_eq!(body["data"]["departmentId"], arts.as_str());
}
