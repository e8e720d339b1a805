use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use uuid::Uuid;

use crate::access::AccessScope;
use crate::db::{now_ms, serialize_ms, DatabaseProxy};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Department {
    pub id: String,
    pub name: String,
    pub code: String,
    pub description: Option<String>,
    pub hod_id: Option<String>,
    #[serde(serialize_with = "serialize_ms")]
    pub created_at: i64,
    #[serde(serialize_with = "serialize_ms")]
    pub updated_at: i64,
}

impl Department {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            code: row.try_get("code")?,
            description: row.try_get("description")?,
            hod_id: row.try_get("hodId")?,
            created_at: row.try_get("createdAt")?,
            updated_at: row.try_get("updatedAt")?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct DepartmentChanges {
    pub name: Option<String>,
    pub code: Option<String>,
    pub description: Option<Option<String>>,
    pub hod_id: Option<Option<String>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepartmentUsage {
    pub groups: i64,
    pub users: i64,
    pub modules: i64,
}

impl DepartmentUsage {
    pub fn is_empty(&self) -> bool {
        self.groups == 0 && self.users == 0 && self.modules == 0
    }
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

pub async fn insert_department(
    proxy: &DatabaseProxy,
    name: &str,
    code: &str,
    description: Option<&str>,
) -> Result<Department, sqlx::Error> {
    let id = Uuid::new_v4().to_string();
    let now = now_ms();
    sqlx::query(
        r#"
        INSERT INTO "departments" ("id", "name", "code", "description", "hodId", "createdAt", "updatedAt")
        VALUES (?, ?, ?, ?, NULL, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(name.trim())
    .bind(normalize_code(code))
    .bind(description)
    .bind(now)
    .bind(now)
    .execute(proxy.pool())
    .await?;

    find_department(proxy, &id)
        .await?
        .ok_or(sqlx::Error::RowNotFound)
}

pub async fn find_department(
    proxy: &DatabaseProxy,
    id: &str,
) -> Result<Option<Department>, sqlx::Error> {
    let row = sqlx::query(r#"SELECT * FROM "departments" WHERE "id" = ?"#)
        .bind(id)
        .fetch_optional(proxy.pool())
        .await?;
    row.as_ref().map(Department::from_row).transpose()
}

pub async fn list_departments(
    proxy: &DatabaseProxy,
    scope: &AccessScope,
) -> Result<Vec<Department>, sqlx::Error> {
    let mut builder: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new(r#"SELECT * FROM "departments" WHERE 1"#);
    if !matches!(scope, AccessScope::All) {
        match scope.department_id() {
            Some(department_id) => {
                builder.push(r#" AND "id" = "#).push_bind(department_id.to_string());
            }
            None => {
                builder.push(" AND 0");
            }
        }
    }
    builder.push(r#" ORDER BY "name""#);

    let rows = builder.build().fetch_all(proxy.pool()).await?;
    rows.iter().map(Department::from_row).collect()
}

pub async fn update_department(
    proxy: &DatabaseProxy,
    id: &str,
    changes: DepartmentChanges,
) -> Result<Option<Department>, sqlx::Error> {
    let mut tx = proxy.pool().begin().await?;
    let now = now_ms();

    let mut builder: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new(r#"UPDATE "departments" SET "updatedAt" = "#);
    builder.push_bind(now);
    if let Some(name) = changes.name {
        builder.push(r#", "name" = "#).push_bind(name.trim().to_string());
    }
    if let Some(code) = changes.code {
        builder.push(r#", "code" = "#).push_bind(normalize_code(&code));
    }
    if let Some(description) = changes.description {
        builder.push(r#", "description" = "#).push_bind(description);
    }
    if let Some(hod_id) = &changes.hod_id {
        builder.push(r#", "hodId" = "#).push_bind(hod_id.clone());
    }
    builder.push(r#" WHERE "id" = "#).push_bind(id.to_string());
    builder.build().execute(&mut *tx).await?;

    // The appointed HOD belongs to the department they head.
    if let Some(Some(hod_id)) = &changes.hod_id {
        sqlx::query(r#"UPDATE "users" SET "departmentId" = ?, "groupId" = NULL, "updatedAt" = ? WHERE "id" = ?"#)
            .bind(id)
            .bind(now)
            .bind(hod_id)
            .execute(&mut *tx)
            .await?;
        super::users::release_stale_links(&mut tx, hod_id).await?;
    }

    tx.commit().await?;
    find_department(proxy, id).await
}

pub async fn department_usage(
    proxy: &DatabaseProxy,
    id: &str,
) -> Result<DepartmentUsage, sqlx::Error> {
    let (groups, users, modules): (i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
            (SELECT COUNT(*) FROM "groups" WHERE "departmentId" = ?1),
            (SELECT COUNT(*) FROM "users" WHERE "departmentId" = ?1),
            (SELECT COUNT(*) FROM "modules" WHERE "departmentId" = ?1)
        "#,
    )
    .bind(id)
    .fetch_one(proxy.pool())
    .await?;
    Ok(DepartmentUsage {
        groups,
        users,
        modules,
    })
}

pub async fn delete_department(proxy: &DatabaseProxy, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(r#"DELETE FROM "departments" WHERE "id" = ?"#)
        .bind(id)
        .execute(proxy.pool())
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn count_departments(proxy: &DatabaseProxy) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(r#"SELECT COUNT(*) FROM "departments""#)
        .fetch_one(proxy.pool())
        .await
}
