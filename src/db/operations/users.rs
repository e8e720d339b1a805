use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, Transaction};
use uuid::Uuid;

use crate::access::{AccessScope, Role};
use crate::auth::AuthUser;
use crate::db::{now_ms, serialize_ms, DatabaseProxy};
use crate::response::Page;

const USER_COLUMNS: &str = r#""id", "email", "username", "role", "departmentId", "groupId", "isActive", "createdAt", "updatedAt""#;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    pub username: String,
    pub role: Role,
    pub department_id: Option<String>,
    pub group_id: Option<String>,
    pub is_active: bool,
    #[serde(serialize_with = "serialize_ms")]
    pub created_at: i64,
    #[serde(serialize_with = "serialize_ms")]
    pub updated_at: i64,
}

impl UserRecord {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let role: String = row.try_get("role")?;
        Ok(Self {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            username: row.try_get("username")?,
            role: Role::parse(&role).ok_or_else(|| sqlx::Error::Decode(
                format!("unknown role {role}").into(),
            ))?,
            department_id: row.try_get("departmentId")?,
            group_id: row.try_get("groupId")?,
            is_active: row.try_get("isActive")?,
            created_at: row.try_get("createdAt")?,
            updated_at: row.try_get("updatedAt")?,
        })
    }

    pub fn into_auth_user(self) -> AuthUser {
        AuthUser {
            id: self.id,
            email: self.email,
            username: self.username,
            role: self.role,
            department_id: self.department_id,
            group_id: self.group_id,
            is_active: self.is_active,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub username: String,
    pub password_hash: String,
    pub role: Role,
    pub department_id: Option<String>,
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UserChanges {
    pub username: Option<String>,
    pub role: Option<Role>,
    pub department_id: Option<Option<String>>,
    pub group_id: Option<Option<String>>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct UserFilter {
    pub role: Option<Role>,
    pub department_id: Option<String>,
    pub group_id: Option<String>,
    pub search: Option<String>,
}

pub async fn insert_user(proxy: &DatabaseProxy, user: NewUser) -> Result<UserRecord, sqlx::Error> {
    let id = Uuid::new_v4().to_string();
    let now = now_ms();
    sqlx::query(
        r#"
        INSERT INTO "users" (
            "id", "email", "username", "passwordHash", "role",
            "departmentId", "groupId", "isActive", "createdAt", "updatedAt"
        ) VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(user.email.trim().to_lowercase())
    .bind(user.username.trim())
    .bind(&user.password_hash)
    .bind(user.role.as_str())
    .bind(&user.department_id)
    .bind(&user.group_id)
    .bind(now)
    .bind(now)
    .execute(proxy.pool())
    .await?;

    find_user(proxy, &id)
        .await?
        .ok_or(sqlx::Error::RowNotFound)
}

pub async fn find_user(proxy: &DatabaseProxy, id: &str) -> Result<Option<UserRecord>, sqlx::Error> {
    let row = sqlx::query(&format!(r#"SELECT {USER_COLUMNS} FROM "users" WHERE "id" = ?"#))
        .bind(id)
        .fetch_optional(proxy.pool())
        .await?;
    row.as_ref().map(UserRecord::from_row).transpose()
}

pub async fn find_auth_user(proxy: &DatabaseProxy, id: &str) -> Result<Option<AuthUser>, sqlx::Error> {
    Ok(find_user(proxy, id).await?.map(UserRecord::into_auth_user))
}

/// Returns the user and the stored password hash.
pub async fn find_credentials_by_email(
    proxy: &DatabaseProxy,
    email: &str,
) -> Result<Option<(UserRecord, String)>, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"SELECT {USER_COLUMNS}, "passwordHash" FROM "users" WHERE "email" = ?"#
    ))
    .bind(email.trim().to_lowercase())
    .fetch_optional(proxy.pool())
    .await?;

    match row {
        Some(row) => {
            let hash: String = row.try_get("passwordHash")?;
            Ok(Some((UserRecord::from_row(&row)?, hash)))
        }
        None => Ok(None),
    }
}

pub async fn password_hash(proxy: &DatabaseProxy, id: &str) -> Result<Option<String>, sqlx::Error> {
    let row: Option<(String,)> = sqlx::query_as(r#"SELECT "passwordHash" FROM "users" WHERE "id" = ?"#)
        .bind(id)
        .fetch_optional(proxy.pool())
        .await?;
    Ok(row.map(|(hash,)| hash))
}

pub async fn email_exists(proxy: &DatabaseProxy, email: &str) -> Result<bool, sqlx::Error> {
    let count: i64 = sqlx::query_scalar(r#"SELECT COUNT(*) FROM "users" WHERE "email" = ?"#)
        .bind(email.trim().to_lowercase())
        .fetch_one(proxy.pool())
        .await?;
    Ok(count > 0)
}

pub async fn count_users(proxy: &DatabaseProxy) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(r#"SELECT COUNT(*) FROM "users""#)
        .fetch_one(proxy.pool())
        .await
}

pub async fn update_password(
    proxy: &DatabaseProxy,
    id: &str,
    password_hash: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(r#"UPDATE "users" SET "passwordHash" = ?, "updatedAt" = ? WHERE "id" = ?"#)
        .bind(password_hash)
        .bind(now_ms())
        .bind(id)
        .execute(proxy.pool())
        .await?;
    Ok(())
}

pub async fn update_user(
    proxy: &DatabaseProxy,
    id: &str,
    changes: UserChanges,
) -> Result<Option<UserRecord>, sqlx::Error> {
    let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(r#"UPDATE "users" SET "updatedAt" = "#);
    builder.push_bind(now_ms());

    if let Some(username) = changes.username {
        builder.push(r#", "username" = "#).push_bind(username.trim().to_string());
    }
    if let Some(role) = changes.role {
        builder.push(r#", "role" = "#).push_bind(role.as_str());
    }
    if let Some(department_id) = changes.department_id {
        builder.push(r#", "departmentId" = "#).push_bind(department_id);
    }
    if let Some(group_id) = changes.group_id {
        builder.push(r#", "groupId" = "#).push_bind(group_id);
    }
    if let Some(is_active) = changes.is_active {
        builder.push(r#", "isActive" = "#).push_bind(is_active);
    }

    builder.push(r#" WHERE "id" = "#).push_bind(id.to_string());

    let mut tx = proxy.pool().begin().await?;
    builder.build().execute(&mut *tx).await?;
    let (groups, departments) = release_stale_links(&mut tx, id).await?;
    tx.commit().await?;
    if groups + departments > 0 {
        tracing::info!(user_id = %id, groups, departments, "stale teacher/HOD links cleared");
    }

    find_user(proxy, id).await
}

/// Unassigns the user from groups they can no longer teach and departments they can no
/// longer head, judged by their current role and department.
pub(crate) async fn release_stale_links(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
) -> Result<(u64, u64), sqlx::Error> {
    let now = now_ms();
    let groups = sqlx::query(
        r#"
        UPDATE "groups" SET "teacherId" = NULL, "updatedAt" = ?
        WHERE "teacherId" = ?
          AND EXISTS (
              SELECT 1 FROM "users" u
              WHERE u."id" = "groups"."teacherId"
                AND (u."role" <> 'TEACHER' OR u."departmentId" IS NOT "groups"."departmentId")
          )
        "#,
    )
    .bind(now)
    .bind(id)
    .execute(&mut **tx)
    .await?
    .rows_affected();

    let departments = sqlx::query(
        r#"
        UPDATE "departments" SET "hodId" = NULL, "updatedAt" = ?
        WHERE "hodId" = ?
          AND EXISTS (
              SELECT 1 FROM "users" u
              WHERE u."id" = "departments"."hodId"
                AND (u."role" <> 'HOD' OR u."departmentId" IS NOT "departments"."id")
          )
        "#,
    )
    .bind(now)
    .bind(id)
    .execute(&mut **tx)
    .await?
    .rows_affected();

    Ok((groups, departments))
}

pub async fn delete_user(proxy: &DatabaseProxy, id: &str) -> Result<bool, sqlx::Error> {
    let mut tx = proxy.pool().begin().await?;
    sqlx::query(r#"UPDATE "departments" SET "hodId" = NULL WHERE "hodId" = ?"#)
        .bind(id)
        .execute(&mut *tx)
        .await?;
    let result = sqlx::query(r#"DELETE FROM "users" WHERE "id" = ?"#)
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}

pub async fn list_users(
    proxy: &DatabaseProxy,
    scope: &AccessScope,
    filter: &UserFilter,
    page: Page,
) -> Result<(Vec<UserRecord>, i64), sqlx::Error> {
    let mut count_builder: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new(r#"SELECT COUNT(*) FROM "users" WHERE 1"#);
    push_user_filters(&mut count_builder, scope, filter);
    let total: i64 = count_builder
        .build_query_scalar()
        .fetch_one(proxy.pool())
        .await?;

    let mut builder: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new(format!(r#"SELECT {USER_COLUMNS} FROM "users" WHERE 1"#));
    push_user_filters(&mut builder, scope, filter);
    builder
        .push(r#" ORDER BY "createdAt" DESC, "id" LIMIT "#)
        .push_bind(page.page_size)
        .push(" OFFSET ")
        .push_bind(page.offset());

    let rows = builder.build().fetch_all(proxy.pool()).await?;
    let users = rows
        .iter()
        .map(UserRecord::from_row)
        .collect::<Result<Vec<_>, _>>()?;
    Ok((users, total))
}

fn push_user_filters(
    builder: &mut QueryBuilder<'_, Sqlite>,
    scope: &AccessScope,
    filter: &UserFilter,
) {
    match scope {
        AccessScope::All => {}
        AccessScope::Department { department_id } => match department_id {
            Some(department_id) => {
                builder.push(r#" AND "departmentId" = "#).push_bind(department_id.clone());
            }
            None => {
                builder.push(" AND 0");
            }
        },
        AccessScope::Teaching { group_ids, .. } => {
            builder.push(r#" AND "role" = 'STUDENT'"#);
            if group_ids.is_empty() {
                builder.push(" AND 0");
            } else {
                builder.push(r#" AND "groupId" IN ("#);
                let mut separated = builder.separated(", ");
                for group_id in group_ids {
                    separated.push_bind(group_id.clone());
                }
                separated.push_unseparated(")");
            }
        }
        AccessScope::Student { user_id, .. } => {
            builder.push(r#" AND "id" = "#).push_bind(user_id.clone());
        }
    }

    if let Some(role) = filter.role {
        builder.push(r#" AND "role" = "#).push_bind(role.as_str());
    }
    if let Some(department_id) = &filter.department_id {
        builder.push(r#" AND "departmentId" = "#).push_bind(department_id.clone());
    }
    if let Some(group_id) = &filter.group_id {
        builder.push(r#" AND "groupId" = "#).push_bind(group_id.clone());
    }
    if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = format!("%{}%", search.to_lowercase());
        builder
            .push(r#" AND (lower("username") LIKE "#)
            .push_bind(pattern.clone())
            .push(r#" OR "email" LIKE "#)
            .push_bind(pattern)
            .push(")");
    }
}

pub async fn users_by_ids(
    proxy: &DatabaseProxy,
    ids: &[String],
) -> Result<Vec<UserRecord>, sqlx::Error> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut builder: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new(format!(r#"SELECT {USER_COLUMNS} FROM "users" WHERE "id" IN ("#));
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(id.clone());
    }
    separated.push_unseparated(")");
    let rows = builder.build().fetch_all(proxy.pool()).await?;
    rows.iter().map(UserRecord::from_row).collect()
}

pub async fn students_in_group(
    proxy: &DatabaseProxy,
    group_id: &str,
) -> Result<Vec<UserRecord>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        r#"SELECT {USER_COLUMNS} FROM "users" WHERE "groupId" = ? AND "role" = 'STUDENT' ORDER BY "username""#
    ))
    .bind(group_id)
    .fetch_all(proxy.pool())
    .await?;
    rows.iter().map(UserRecord::from_row).collect()
}

pub async fn students_in_department(
    proxy: &DatabaseProxy,
    department_id: &str,
) -> Result<Vec<UserRecord>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        r#"SELECT {USER_COLUMNS} FROM "users" WHERE "departmentId" = ? AND "role" = 'STUDENT' ORDER BY "username""#
    ))
    .bind(department_id)
    .fetch_all(proxy.pool())
    .await?;
    rows.iter().map(UserRecord::from_row).collect()
}

pub async fn set_group(
    proxy: &DatabaseProxy,
    user_ids: &[String],
    group_id: Option<&str>,
) -> Result<u64, sqlx::Error> {
    if user_ids.is_empty() {
        return Ok(0);
    }
    let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(r#"UPDATE "users" SET "groupId" = "#);
    builder
        .push_bind(group_id.map(str::to_string))
        .push(r#", "updatedAt" = "#)
        .push_bind(now_ms())
        .push(r#" WHERE "id" IN ("#);
    let mut separated = builder.separated(", ");
    for id in user_ids {
        separated.push_bind(id.clone());
    }
    separated.push_unseparated(")");
    let result = builder.build().execute(proxy.pool()).await?;
    Ok(result.rows_affected())
}

pub async fn count_by_role(proxy: &DatabaseProxy) -> Result<Vec<(String, i64)>, sqlx::Error> {
    sqlx::query_as(r#"SELECT "role", COUNT(*) FROM "users" GROUP BY "role" ORDER BY "role""#)
        .fetch_all(proxy.pool())
        .await
}
