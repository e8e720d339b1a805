use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, put};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use crate::access::{require_role, AccessScope, Role};
use crate::auth::AuthUser;
use crate::db::operations::assessments;
use crate::db::operations::groups;
use crate::db::operations::modules::{self, Module, ModuleChanges, ModuleFilter, NewModule};
use crate::db::operations::departments;
use crate::db::DatabaseProxy;
use crate::response::{created, ok, AppError};
use crate::services::analytics::PASS_THRESHOLD;
use crate::services::prerequisites::{GraphError, PrerequisiteGraph};
use crate::state::AppState;

use super::double_option;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_modules).post(create_module))
        .route("/order", get(module_order))
        .route("/:id", get(get_module).put(update_module).delete(delete_module))
        .route("/:id/prerequisites", put(set_prerequisites))
        .route("/:id/status", get(module_status))
        .route(
            "/:id/questions",
            get(super::questions::list_for_module).post(super::questions::create_for_module),
        )
}

impl From<GraphError> for AppError {
    fn from(err: GraphError) -> Self {
        AppError::bad_request(err.to_string()).with_code("CIRCULAR_PREREQUISITE")
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    department_id: Option<String>,
    group_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateModuleRequest {
    title: String,
    description: Option<String>,
    notes: Option<String>,
    department_id: Option<String>,
    group_id: Option<String>,
    order_index: Option<i64>,
    is_published: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateModuleRequest {
    title: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    description: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    notes: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    group_id: Option<Option<String>>,
    order_index: Option<i64>,
    is_published: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrerequisitesRequest {
    prerequisite_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrerequisiteState {
    module_id: String,
    title: String,
    has_assessments: bool,
    best_percentage: Option<f64>,
    satisfied: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModuleStatus {
    module_id: String,
    unlocked: bool,
    pass_threshold: f64,
    prerequisites: Vec<PrerequisiteState>,
    blocking: Vec<String>,
}

async fn list_modules(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    let filter = ModuleFilter {
        department_id: super::non_blank(query.department_id),
        group_id: super::non_blank(query.group_id),
    };
    Ok(ok(modules::list_modules(&proxy, &scope, &filter).await?))
}

async fn create_module(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(payload): Json<CreateModuleRequest>,
) -> Result<impl IntoResponse, AppError> {
    require_role(&user, &[Role::Admin, Role::Hod, Role::Teacher])?;
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;

    let title = payload.title.trim();
    if title.is_empty() {
        return Err(AppError::validation("Module title is required"));
    }
    let department_id = super::non_blank(payload.department_id)
        .or_else(|| user.department_id.clone())
        .ok_or_else(|| AppError::validation("departmentId is required"))?;
    if departments::find_department(&proxy, &department_id).await?.is_none() {
        return Err(AppError::validation("Department does not exist"));
    }
    let group_id = super::non_blank(payload.group_id);
    check_group(&proxy, group_id.as_deref(), &department_id).await?;
    if !scope.can_author(&department_id, group_id.as_deref()) {
        return Err(AppError::forbidden("You cannot create modules here"));
    }

    let module = modules::insert_module(
        &proxy,
        NewModule {
            title: title.to_string(),
            description: super::non_blank(payload.description),
            notes: payload.notes,
            department_id,
            group_id,
            order_index: payload.order_index.unwrap_or(0),
            is_published: payload.is_published.unwrap_or(false),
            created_by: user.id.clone(),
        },
    )
    .await?;
    tracing::info!(module_id = %module.id, author_id = %user.id, "module created");
    Ok(created(module))
}

async fn get_module(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    Ok(ok(visible_module(&proxy, &scope, &id).await?))
}

async fn update_module(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateModuleRequest>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    let module = authored_module(&proxy, &scope, &id).await?;

    if let Some(title) = &payload.title {
        if title.trim().is_empty() {
            return Err(AppError::validation("Module title cannot be empty"));
        }
    }
    let group_id = payload.group_id.map(super::non_blank);
    if let Some(group_id) = &group_id {
        check_group(&proxy, group_id.as_deref(), &module.department_id).await?;
        if !scope.can_author(&module.department_id, group_id.as_deref()) {
            return Err(AppError::forbidden("You cannot move this module to that group"));
        }
    }

    let changes = ModuleChanges {
        title: payload.title,
        description: payload.description.map(super::non_blank),
        notes: payload.notes,
        group_id,
        order_index: payload.order_index,
        is_published: payload.is_published,
    };
    let module = modules::update_module(&proxy, &id, changes)
        .await?
        .ok_or_else(|| AppError::not_found("Module not found"))?;
    Ok(ok(module))
}

async fn delete_module(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    authored_module(&proxy, &scope, &id).await?;
    let assessment_ids = assessments::assessment_ids_for_module(&proxy, &id).await?;
    let affected = assessments::students_with_submissions(&proxy, &assessment_ids).await?;
    modules::delete_module(&proxy, &id).await?;
    super::assessments::refresh_student_metrics(&state, &proxy, &affected).await?;
    tracing::info!(
        module_id = %id,
        actor_id = %user.id,
        students = affected.len(),
        "module deleted"
    );
    Ok(ok(serde_json::json!({ "id": id })))
}

/// Replaces the prerequisite set after checking the graph stays acyclic.
async fn set_prerequisites(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(payload): Json<PrerequisitesRequest>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    let module = authored_module(&proxy, &scope, &id).await?;

    let mut prerequisite_ids: Vec<String> = payload
        .prerequisite_ids
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    prerequisite_ids.sort();
    prerequisite_ids.dedup();

    let prerequisites = modules::modules_by_ids(&proxy, &prerequisite_ids).await?;
    if prerequisites.len() != prerequisite_ids.len() {
        return Err(AppError::validation("Some prerequisite modules do not exist"));
    }
    if prerequisites
        .iter()
        .any(|p| p.department_id != module.department_id)
    {
        return Err(AppError::validation(
            "Prerequisites must belong to the same department",
        ));
    }

    // Touching the module first takes the write lock, so the edges read below cannot
    // change before the replacement commits.
    let mut tx = proxy.pool().begin().await?;
    modules::touch_module(&mut *tx, &id).await?;
    let graph = PrerequisiteGraph::from_edges(
        modules::department_edges(&mut *tx, &module.department_id).await?,
    );
    if let Err(err) = graph.validate_replacement(&id, &prerequisite_ids) {
        tracing::info!(module_id = %id, error = %err, "prerequisite change rejected");
        return Err(err.into());
    }
    modules::replace_prerequisites(&mut tx, &id, &prerequisite_ids).await?;
    tx.commit().await?;

    let module = modules::find_module(&proxy, &id)
        .await?
        .ok_or_else(|| AppError::not_found("Module not found"))?;
    Ok(ok(module))
}

/// Visible modules ordered so each follows its prerequisites.
async fn module_order(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, AppError> {
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    let filter = ModuleFilter {
        department_id: super::non_blank(query.department_id),
        group_id: super::non_blank(query.group_id),
    };
    let visible = modules::list_modules(&proxy, &scope, &filter).await?;

    let graph = PrerequisiteGraph::from_edges(visible.iter().flat_map(|m| {
        m.prerequisite_ids
            .iter()
            .map(move |p| (m.id.clone(), p.clone()))
    }));
    let ranks: Vec<(String, (i64, String))> = visible
        .iter()
        .map(|m| (m.id.clone(), (m.order_index, m.title.to_lowercase())))
        .collect();
    let order = graph.topological_order(&ranks)?;

    let mut by_id: HashMap<String, Module> =
        visible.into_iter().map(|m| (m.id.clone(), m)).collect();
    let ordered: Vec<Module> = order.into_iter().filter_map(|id| by_id.remove(&id)).collect();
    Ok(ok(ordered))
}

/// Whether the calling student has satisfied every prerequisite of the module.
async fn module_status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    require_role(&user, &[Role::Student])?;
    let proxy = state.require_db()?;
    let scope = AccessScope::resolve(&proxy, &user).await?;
    let module = visible_module(&proxy, &scope, &id).await?;

    let best = assessments::best_percentage_by_module(
        &proxy,
        &scope,
        &user.id,
        &module.prerequisite_ids,
    ).await?;
    let titles: HashMap<String, String> = modules::modules_by_ids(&proxy, &module.prerequisite_ids)
        .await?
        .into_iter()
        .map(|m| (m.id, m.title))
        .collect();

    let prerequisites: Vec<PrerequisiteState> = module
        .prerequisite_ids
        .iter()
        .map(|prerequisite_id| {
            let entry = best.get(prerequisite_id);
            let best_percentage = entry.copied().flatten();
            PrerequisiteState {
                module_id: prerequisite_id.clone(),
                title: titles.get(prerequisite_id).cloned().unwrap_or_default(),
                has_assessments: entry.is_some(),
                best_percentage,
                satisfied: entry.is_none() || best_percentage.map_or(false, |p| p >= PASS_THRESHOLD),
            }
        })
        .collect();
    let blocking: Vec<String> = prerequisites
        .iter()
        .filter(|p| !p.satisfied)
        .map(|p| p.module_id.clone())
        .collect();

    Ok(ok(ModuleStatus {
        module_id: module.id,
        unlocked: blocking.is_empty(),
        pass_threshold: PASS_THRESHOLD,
        prerequisites,
        blocking,
    }))
}

pub(super) async fn visible_module(
    proxy: &DatabaseProxy,
    scope: &AccessScope,
    id: &str,
) -> Result<Module, AppError> {
    modules::find_module(proxy, id)
        .await?
        .filter(|m| scope.can_view_content(&m.department_id, m.group_id.as_deref(), m.is_published))
        .ok_or_else(|| AppError::not_found("Module not found"))
}

/// A visible module the caller may edit; 403 when visible but not editable.
pub(super) async fn authored_module(
    proxy: &DatabaseProxy,
    scope: &AccessScope,
    id: &str,
) -> Result<Module, AppError> {
    let module = visible_module(proxy, scope, id).await?;
    if !scope.can_author(&module.department_id, module.group_id.as_deref()) {
        return Err(AppError::forbidden("You cannot edit this module"));
    }
    Ok(module)
}

async fn check_group(
    proxy: &DatabaseProxy,
    group_id: Option<&str>,
    department_id: &str,
) -> Result<(), AppError> {
    let Some(group_id) = group_id else {
        return Ok(());
    };
    let group = groups::find_group(proxy, group_id)
        .await?
        .ok_or_else(|| AppError::validation("Group does not exist"))?;
    if group.department_id != department_id {
        return Err(AppError::validation(
            "Group must belong to the module's department",
        ));
    }
    Ok(())
}
