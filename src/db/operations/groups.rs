use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use uuid::Uuid;

use crate::access::{AccessScope, ScopeColumns};
use crate::db::{now_ms, serialize_ms, DatabaseProxy};

const GROUP_SELECT: &str = r#"
    SELECT g."id", g."name", g."departmentId", g."teacherId", g."description",
           g."createdAt", g."updatedAt",
           (SELECT COUNT(*) FROM "users" u WHERE u."groupId" = g."id" AND u."role" = 'STUDENT') AS "memberCount"
    FROM "groups" g
"#;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub name: String,
    pub department_id: String,
    pub teacher_id: Option<String>,
    pub description: Option<String>,
    pub member_count: i64,
    #[serde(serialize_with = "serialize_ms")]
    pub created_at: i64,
    #[serde(serialize_with = "serialize_ms")]
    pub updated_at: i64,
}

impl Group {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            department_id: row.try_get("departmentId")?,
            teacher_id: row.try_get("teacherId")?,
            description: row.try_get("description")?,
            member_count: row.try_get("memberCount")?,
            created_at: row.try_get("createdAt")?,
            updated_at: row.try_get("updatedAt")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewGroup {
    pub name: String,
    pub department_id: String,
    pub teacher_id: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GroupChanges {
    pub name: Option<String>,
    pub teacher_id: Option<Option<String>>,
    pub description: Option<Option<String>>,
}

pub async fn insert_group(proxy: &DatabaseProxy, group: NewGroup) -> Result<Group, sqlx::Error> {
    let id = Uuid::new_v4().to_string();
    let now = now_ms();
    sqlx::query(
        r#"
        INSERT INTO "groups" ("id", "name", "departmentId", "teacherId", "description", "createdAt", "updatedAt")
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(group.name.trim())
    .bind(&group.department_id)
    .bind(&group.teacher_id)
    .bind(&group.description)
    .bind(now)
    .bind(now)
    .execute(proxy.pool())
    .await?;

    find_group(proxy, &id).await?.ok_or(sqlx::Error::RowNotFound)
}

pub async fn find_group(proxy: &DatabaseProxy, id: &str) -> Result<Option<Group>, sqlx::Error> {
    let row = sqlx::query(&format!(r#"{GROUP_SELECT} WHERE g."id" = ?"#))
        .bind(id)
        .fetch_optional(proxy.pool())
        .await?;
    row.as_ref().map(Group::from_row).transpose()
}

pub async fn list_groups(
    proxy: &DatabaseProxy,
    scope: &AccessScope,
    department_id: Option<&str>,
) -> Result<Vec<Group>, sqlx::Error> {
    let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!("{GROUP_SELECT} WHERE 1"));
    match scope {
        AccessScope::Student { group_id, .. } => match group_id {
            Some(group_id) => {
                builder.push(r#" AND g."id" = "#).push_bind(group_id.clone());
            }
            None => {
                builder.push(" AND 0");
            }
        },
        _ => scope.push_filter(
            &mut builder,
            ScopeColumns {
                department: r#"g."departmentId""#,
                group: None,
            },
            None,
        ),
    }
    if let Some(department_id) = department_id {
        builder.push(r#" AND g."departmentId" = "#).push_bind(department_id.to_string());
    }
    builder.push(r#" ORDER BY g."name""#);

    let rows = builder.build().fetch_all(proxy.pool()).await?;
    rows.iter().map(Group::from_row).collect()
}

pub async fn update_group(
    proxy: &DatabaseProxy,
    id: &str,
    changes: GroupChanges,
) -> Result<Option<Group>, sqlx::Error> {
    let mut builder: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new(r#"UPDATE "groups" SET "updatedAt" = "#);
    builder.push_bind(now_ms());
    if let Some(name) = changes.name {
        builder.push(r#", "name" = "#).push_bind(name.trim().to_string());
    }
    if let Some(teacher_id) = changes.teacher_id {
        builder.push(r#", "teacherId" = "#).push_bind(teacher_id);
    }
    if let Some(description) = changes.description {
        builder.push(r#", "description" = "#).push_bind(description);
    }
    builder.push(r#" WHERE "id" = "#).push_bind(id.to_string());
    builder.build().execute(proxy.pool()).await?;

    find_group(proxy, id).await
}

/// Deletes the group; its students become unassigned.
pub async fn delete_group(proxy: &DatabaseProxy, id: &str) -> Result<bool, sqlx::Error> {
    let mut tx = proxy.pool().begin().await?;
    sqlx::query(r#"UPDATE "users" SET "groupId" = NULL, "updatedAt" = ? WHERE "groupId" = ?"#)
        .bind(now_ms())
        .bind(id)
        .execute(&mut *tx)
        .await?;
    let result = sqlx::query(r#"DELETE FROM "groups" WHERE "id" = ?"#)
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}

pub async fn group_ids_taught_by(
    proxy: &DatabaseProxy,
    teacher_id: &str,
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar(r#"SELECT "id" FROM "groups" WHERE "teacherId" = ? ORDER BY "id""#)
        .bind(teacher_id)
        .fetch_all(proxy.pool())
        .await
}

pub async fn groups_in_department(
    proxy: &DatabaseProxy,
    department_id: &str,
) -> Result<Vec<Group>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        r#"{GROUP_SELECT} WHERE g."departmentId" = ? ORDER BY g."name""#
    ))
    .bind(department_id)
    .fetch_all(proxy.pool())
    .await?;
    rows.iter().map(Group::from_row).collect()
}

pub async fn count_groups(proxy: &DatabaseProxy) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(r#"SELECT COUNT(*) FROM "groups""#)
        .fetch_one(proxy.pool())
        .await
}
