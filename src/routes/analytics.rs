use std::collections::{BTreeMap, HashMap};

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Extension, Router};
use serde::Serialize;

use crate::access::{require_role, AccessScope, Role};
use crate::auth::AuthUser;
use crate::cache::keys::{student_summary_key, ANALYTICS_TTL};
use crate::db::operations::assessments::{self, StudentAttempt};
use crate::db::operations::groups::{self, Group};
use crate::db::operations::metrics::{self, PerformanceMetric};
use crate::db::operations::users::{self, UserRecord};
use crate::db::operations::{departments, modules};
use crate::db::{now_ms, DatabaseProxy};
use crate::response::{ok, AppError};
use crate::services::analytics::{self, round2, Bucket};
use crate::state::AppState;

const RECENT_SUBMISSIONS: usize = 10;
const TOP_STUDENTS: usize = 5;
const OVERVIEW_WINDOW_MS: i64 = 7 * 24 * 60 * 60 * 1000;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/me", get(my_analytics))
        .route("/students/:id", get(student_analytics))
        .route("/groups/:id", get(group_analytics))
        .route("/departments/:id", get(department_analytics))
        .route("/overview", get(overview))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModuleProgress {
    module_id: String,
    module_title: String,
    attempts: usize,
    average_percentage: f64,
    best_percentage: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StudentSummary {
    student_id: String,
    metric: PerformanceMetric,
    modules: Vec<ModuleProgress>,
    recent_submissions: Vec<StudentAttempt>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StudentStanding {
    student_id: String,
    username: String,
    average_percentage: f64,
    total_submissions: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GroupAnalytics {
    group_id: String,
    group_name: String,
    member_count: usize,
    active_students: usize,
    mean_average: Option<f64>,
    median_average: Option<f64>,
    distribution: Vec<Bucket>,
    top_students: Vec<StudentStanding>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DepartmentTotals {
    student_count: usize,
    active_students: usize,
    ungrouped_students: usize,
    mean_average: Option<f64>,
    median_average: Option<f64>,
    distribution: Vec<Bucket>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DepartmentAnalytics {
    department_id: String,
    department_name: String,
    groups: Vec<GroupAnalytics>,
    totals: DepartmentTotals,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Overview {
    users_by_role: BTreeMap<String, i64>,
    departments: i64,
    groups: i64,
    modules: i64,
    assessments: i64,
    submissions_last_7_days: i64,
}

async fn my_analytics(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<impl IntoResponse, AppError> {
    require_role(&user, &[Role::Student])?;
    let proxy = state.require_db()?;
    Ok(ok(cached_student_summary(&state, &proxy, &user.id).await?))
}

async fn student_analytics(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    let student = users::find_user(&proxy, &id)
        .await?
        .filter(|u| u.role == Role::Student)
        .filter(|u| scope.can_view_student(&u.id, u.department_id.as_deref(), u.group_id.as_deref()))
        .ok_or_else(|| AppError::not_found("Student not found"))?;
    Ok(ok(cached_student_summary(&state, &proxy, &student.id).await?))
}

async fn group_analytics(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    require_role(&user, &[Role::Admin, Role::Hod, Role::Teacher])?;
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    let group = groups::find_group(&proxy, &id)
        .await?
        .filter(|g| scope.can_see_group(&g.id, &g.department_id))
        .ok_or_else(|| AppError::not_found("Group not found"))?;
    if matches!(scope, AccessScope::Teaching { .. }) && !scope.teaches(&group.id) {
        return Err(AppError::forbidden("You do not teach this group"));
    }
    Ok(ok(summarize_group(&proxy, group).await?))
}

async fn department_analytics(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    require_role(&user, &[Role::Admin, Role::Hod])?;
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    let department = departments::find_department(&proxy, &id)
        .await?
        .filter(|d| scope.can_manage_department(&d.id))
        .ok_or_else(|| AppError::not_found("Department not found"))?;

    let mut group_summaries = Vec::new();
    for group in groups::groups_in_department(&proxy, &id).await? {
        group_summaries.push(summarize_group(&proxy, group).await?);
    }

    let students = users::students_in_department(&proxy, &id).await?;
    let ungrouped_students = students.iter().filter(|s| s.group_id.is_none()).count();
    let standings = standings(&proxy, &students).await?;
    let averages: Vec<f64> = standings.iter().map(|s| s.average_percentage).collect();

    Ok(ok(DepartmentAnalytics {
        department_id: department.id,
        department_name: department.name,
        groups: group_summaries,
        totals: DepartmentTotals {
            student_count: students.len(),
            active_students: standings.len(),
            ungrouped_students,
            mean_average: analytics::mean(&averages),
            median_average: analytics::median(&averages),
            distribution: analytics::distribution(&averages),
        },
    }))
}

async fn overview(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<impl IntoResponse, AppError> {
    require_role(&user, &[Role::Admin])?;
    let proxy = state.require_db()?;

    let mut users_by_role: BTreeMap<String, i64> = [Role::Admin, Role::Hod, Role::Teacher, Role::Student]
        .iter()
        .map(|role| (role.as_str().to_string(), 0))
        .collect();
    users_by_role.extend(users::count_by_role(&proxy).await?);

    Ok(ok(Overview {
        users_by_role,
        departments: departments::count_departments(&proxy).await?,
        groups: groups::count_groups(&proxy).await?,
        modules: modules::count_modules(&proxy).await?,
        assessments: assessments::count_assessments(&proxy).await?,
        submissions_last_7_days: assessments::count_submissions_since(
            &proxy,
            now_ms() - OVERVIEW_WINDOW_MS,
        )
        .await?,
    }))
}

/// Student summaries are cached as JSON and dropped whenever the student submits.
async fn cached_student_summary(
    state: &AppState,
    proxy: &DatabaseProxy,
    student_id: &str,
) -> Result<serde_json::Value, AppError> {
    let key = student_summary_key(student_id);
    if let Some(cache) = state.cache() {
        if let Some(summary) = cache.get::<serde_json::Value>(&key).await {
            return Ok(summary);
        }
    }

    let summary = serde_json::to_value(student_summary(proxy, student_id).await?)
        .map_err(|err| AppError::internal(err.to_string()))?;
    if let Some(cache) = state.cache() {
        cache.set(&key, &summary, ANALYTICS_TTL).await;
    }
    Ok(summary)
}

async fn student_summary(
    proxy: &DatabaseProxy,
    student_id: &str,
) -> Result<StudentSummary, AppError> {
    let metric = analytics::load_metric(proxy, student_id).await?;
    let attempts = assessments::attempts_for_student(proxy, student_id).await?;

    let mut by_module: Vec<(String, String, Vec<f64>)> = Vec::new();
    for attempt in &attempts {
        match by_module.iter_mut().find(|(id, _, _)| *id == attempt.module_id) {
            Some((_, _, scores)) => scores.push(attempt.percentage),
            None => by_module.push((
                attempt.module_id.clone(),
                attempt.module_title.clone(),
                vec![attempt.percentage],
            )),
        }
    }
    let modules = by_module
        .into_iter()
        .map(|(module_id, module_title, scores)| ModuleProgress {
            module_id,
            module_title,
            attempts: scores.len(),
            average_percentage: analytics::mean(&scores).unwrap_or(0.0),
            best_percentage: round2(scores.iter().copied().fold(0.0, f64::max)),
        })
        .collect();

    let recent_submissions = attempts.into_iter().rev().take(RECENT_SUBMISSIONS).collect();
    Ok(StudentSummary {
        student_id: student_id.to_string(),
        metric,
        modules,
        recent_submissions,
    })
}

async fn summarize_group(proxy: &DatabaseProxy, group: Group) -> Result<GroupAnalytics, AppError> {
    let members = users::students_in_group(proxy, &group.id).await?;
    let mut standings = standings(proxy, &members).await?;
    let averages: Vec<f64> = standings.iter().map(|s| s.average_percentage).collect();
    let mean_average = analytics::mean(&averages);
    let median_average = analytics::median(&averages);
    let distribution = analytics::distribution(&averages);
    let active_students = standings.len();

    standings.sort_by(|a, b| {
        b.average_percentage
            .total_cmp(&a.average_percentage)
            .then_with(|| a.username.cmp(&b.username))
    });
    standings.truncate(TOP_STUDENTS);

    Ok(GroupAnalytics {
        group_id: group.id,
        group_name: group.name,
        member_count: members.len(),
        active_students,
        mean_average,
        median_average,
        distribution,
        top_students: standings,
    })
}

/// Averages of the students who have submitted at least once.
async fn standings(
    proxy: &DatabaseProxy,
    students: &[UserRecord],
) -> Result<Vec<StudentStanding>, AppError> {
    let ids: Vec<String> = students.iter().map(|s| s.id.clone()).collect();
    let metrics: HashMap<String, PerformanceMetric> = metrics::metrics_for_students(proxy, &ids)
        .await?
        .into_iter()
        .map(|m| (m.student_id.clone(), m))
        .collect();

    Ok(students
        .iter()
        .filter_map(|student| {
            let metric = metrics.get(&student.id)?;
            (metric.total_submissions > 0).then(|| StudentStanding {
                student_id: student.id.clone(),
                username: student.username.clone(),
                average_percentage: metric.average_percentage,
                total_submissions: metric.total_submissions,
            })
        })
        .collect())
}
