use std::collections::HashMap;

use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, QueryBuilder, Row, Sqlite, Transaction};
use uuid::Uuid;

use crate::access::{AccessScope, ScopeColumns};
use crate::db::{now_ms, serialize_ms, DatabaseProxy};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub notes: Option<String>,
    pub department_id: String,
    pub group_id: Option<String>,
    pub order_index: i64,
    pub is_published: bool,
    pub created_by: String,
    pub prerequisite_ids: Vec<String>,
    #[serde(serialize_with = "serialize_ms")]
    pub created_at: i64,
    #[serde(serialize_with = "serialize_ms")]
    pub updated_at: i64,
}

impl Module {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            notes: row.try_get("notes")?,
            department_id: row.try_get("departmentId")?,
            group_id: row.try_get("groupId")?,
            order_index: row.try_get("orderIndex")?,
            is_published: row.try_get("isPublished")?,
            created_by: row.try_get("createdBy")?,
            prerequisite_ids: Vec::new(),
            created_at: row.try_get("createdAt")?,
            updated_at: row.try_get("updatedAt")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewModule {
    pub title: String,
    pub description: Option<String>,
    pub notes: Option<String>,
    pub department_id: String,
    pub group_id: Option<String>,
    pub order_index: i64,
    pub is_published: bool,
    pub created_by: String,
}

#[derive(Debug, Clone, Default)]
pub struct ModuleChanges {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub notes: Option<Option<String>>,
    pub group_id: Option<Option<String>>,
    pub order_index: Option<i64>,
    pub is_published: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct ModuleFilter {
    pub department_id: Option<String>,
    pub group_id: Option<String>,
}

pub async fn insert_module(proxy: &DatabaseProxy, module: NewModule) -> Result<Module, sqlx::Error> {
    let id = Uuid::new_v4().to_string();
    let now = now_ms();
    sqlx::query(
        r#"
        INSERT INTO "modules" (
            "id", "title", "description", "notes", "departmentId", "groupId",
            "orderIndex", "isPublished", "createdBy", "createdAt", "updatedAt"
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(module.title.trim())
    .bind(&module.description)
    .bind(&module.notes)
    .bind(&module.department_id)
    .bind(&module.group_id)
    .bind(module.order_index)
    .bind(module.is_published)
    .bind(&module.created_by)
    .bind(now)
    .bind(now)
    .execute(proxy.pool())
    .await?;

    find_module(proxy, &id).await?.ok_or(sqlx::Error::RowNotFound)
}

pub async fn find_module(proxy: &DatabaseProxy, id: &str) -> Result<Option<Module>, sqlx::Error> {
    let row = sqlx::query(r#"SELECT * FROM "modules" WHERE "id" = ?"#)
        .bind(id)
        .fetch_optional(proxy.pool())
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let mut module = Module::from_row(&row)?;
    module.prerequisite_ids = prerequisite_ids(proxy, id).await?;
    Ok(Some(module))
}

pub async fn list_modules(
    proxy: &DatabaseProxy,
    scope: &AccessScope,
    filter: &ModuleFilter,
) -> Result<Vec<Module>, sqlx::Error> {
    let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(r#"SELECT * FROM "modules" WHERE 1"#);
    scope.push_filter(
        &mut builder,
        ScopeColumns {
            department: r#""departmentId""#,
            group: Some(r#""groupId""#),
        },
        Some(r#""isPublished""#),
    );
    if let Some(department_id) = &filter.department_id {
        builder.push(r#" AND "departmentId" = "#).push_bind(department_id.clone());
    }
    if let Some(group_id) = &filter.group_id {
        builder
            .push(r#" AND ("groupId" IS NULL OR "groupId" = "#)
            .push_bind(group_id.clone())
            .push(")");
    }
    builder.push(r#" ORDER BY "orderIndex", "title""#);

    let rows = builder.build().fetch_all(proxy.pool()).await?;
    let mut modules = rows
        .iter()
        .map(Module::from_row)
        .collect::<Result<Vec<_>, _>>()?;

    let ids: Vec<String> = modules.iter().map(|m| m.id.clone()).collect();
    let mut edges = prerequisite_map(proxy, &ids).await?;
    for module in &mut modules {
        module.prerequisite_ids = edges.remove(&module.id).unwrap_or_default();
    }
    Ok(modules)
}

pub async fn modules_by_ids(
    proxy: &DatabaseProxy,
    ids: &[String],
) -> Result<Vec<Module>, sqlx::Error> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut builder: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new(r#"SELECT * FROM "modules" WHERE "id" IN ("#);
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(id.clone());
    }
    separated.push_unseparated(")");
    let rows = builder.build().fetch_all(proxy.pool()).await?;
    rows.iter().map(Module::from_row).collect()
}

pub async fn update_module(
    proxy: &DatabaseProxy,
    id: &str,
    changes: ModuleChanges,
) -> Result<Option<Module>, sqlx::Error> {
    let mut builder: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new(r#"UPDATE "modules" SET "updatedAt" = "#);
    builder.push_bind(now_ms());
    if let Some(title) = changes.title {
        builder.push(r#", "title" = "#).push_bind(title.trim().to_string());
    }
    if let Some(description) = changes.description {
        builder.push(r#", "description" = "#).push_bind(description);
    }
    if let Some(notes) = changes.notes {
        builder.push(r#", "notes" = "#).push_bind(notes);
    }
    if let Some(group_id) = changes.group_id {
        builder.push(r#", "groupId" = "#).push_bind(group_id);
    }
    if let Some(order_index) = changes.order_index {
        builder.push(r#", "orderIndex" = "#).push_bind(order_index);
    }
    if let Some(is_published) = changes.is_published {
        builder.push(r#", "isPublished" = "#).push_bind(is_published);
    }
    builder.push(r#" WHERE "id" = "#).push_bind(id.to_string());
    builder.build().execute(proxy.pool()).await?;

    find_module(proxy, id).await
}

/// Removes the module with its prerequisite edges (both directions), questions and assessments.
pub async fn delete_module(proxy: &DatabaseProxy, id: &str) -> Result<bool, sqlx::Error> {
    let mut tx = proxy.pool().begin().await?;
    sqlx::query(r#"DELETE FROM "module_prerequisites" WHERE "moduleId" = ?1 OR "prerequisiteId" = ?1"#)
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(r#"DELETE FROM "assessments" WHERE "moduleId" = ?"#)
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(r#"DELETE FROM "questions" WHERE "moduleId" = ?"#)
        .bind(id)
        .execute(&mut *tx)
        .await?;
    let result = sqlx::query(r#"DELETE FROM "modules" WHERE "id" = ?"#)
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}

pub async fn prerequisite_ids(proxy: &DatabaseProxy, module_id: &str) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar(
        r#"SELECT "prerequisiteId" FROM "module_prerequisites" WHERE "moduleId" = ? ORDER BY "prerequisiteId""#,
    )
    .bind(module_id)
    .fetch_all(proxy.pool())
    .await
}

async fn prerequisite_map(
    proxy: &DatabaseProxy,
    module_ids: &[String],
) -> Result<HashMap<String, Vec<String>>, sqlx::Error> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    if module_ids.is_empty() {
        return Ok(map);
    }
    let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
        r#"SELECT "moduleId", "prerequisiteId" FROM "module_prerequisites" WHERE "moduleId" IN ("#,
    );
    let mut separated = builder.separated(", ");
    for id in module_ids {
        separated.push_bind(id.clone());
    }
    separated.push_unseparated(r#") ORDER BY "prerequisiteId""#);

    let rows: Vec<(String, String)> = builder.build_query_as().fetch_all(proxy.pool()).await?;
    for (module_id, prerequisite_id) in rows {
        map.entry(module_id).or_default().push(prerequisite_id);
    }
    Ok(map)
}

pub async fn touch_module<'e, E>(executor: E, module_id: &str) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(r#"UPDATE "modules" SET "updatedAt" = ? WHERE "id" = ?"#)
        .bind(now_ms())
        .bind(module_id)
        .execute(executor)
        .await?;
    Ok(())
}

/// All edges `(moduleId, prerequisiteId)` whose module belongs to the department.
pub async fn department_edges<'e, E>(
    executor: E,
    department_id: &str,
) -> Result<Vec<(String, String)>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as(
        r#"
        SELECT p."moduleId", p."prerequisiteId"
        FROM "module_prerequisites" p
        JOIN "modules" m ON m."id" = p."moduleId"
        WHERE m."departmentId" = ?
        "#,
    )
    .bind(department_id)
    .fetch_all(executor)
    .await
}

/// Writes the module's new edges inside the caller's transaction.
pub async fn replace_prerequisites(
    tx: &mut Transaction<'_, Sqlite>,
    module_id: &str,
    prerequisite_ids: &[String],
) -> Result<(), sqlx::Error> {
    sqlx::query(r#"DELETE FROM "module_prerequisites" WHERE "moduleId" = ?"#)
        .bind(module_id)
        .execute(&mut **tx)
        .await?;
    for prerequisite_id in prerequisite_ids {
        sqlx::query(r#"INSERT INTO "module_prerequisites" ("moduleId", "prerequisiteId") VALUES (?, ?)"#)
            .bind(module_id)
            .bind(prerequisite_id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

pub async fn count_modules(proxy: &DatabaseProxy) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(r#"SELECT COUNT(*) FROM "modules""#)
        .fetch_one(proxy.pool())
        .await
}
