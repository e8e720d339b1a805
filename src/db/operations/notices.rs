use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use uuid::Uuid;

use crate::access::Role;
use crate::db::{now_ms, serialize_ms, serialize_opt_ms, DatabaseProxy};
use crate::services::notices::{Audience, NoticeTarget, Priority, Recipient};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub id: String,
    pub title: String,
    pub body: String,
    pub priority: Priority,
    pub target: NoticeTarget,
    pub target_department_id: Option<String>,
    pub target_group_id: Option<String>,
    pub target_roles: Vec<Role>,
    pub author_id: String,
    pub author_name: Option<String>,
    #[serde(serialize_with = "serialize_opt_ms")]
    pub expires_at: Option<i64>,
    pub is_read: bool,
    #[serde(serialize_with = "serialize_opt_ms")]
    pub read_at: Option<i64>,
    #[serde(serialize_with = "serialize_ms")]
    pub created_at: i64,
    #[serde(serialize_with = "serialize_ms")]
    pub updated_at: i64,
}

impl Notice {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let target: String = row.try_get("target")?;
        let priority: String = row.try_get("priority")?;
        let roles: String = row.try_get("targetRoles")?;
        let read_at: Option<i64> = row.try_get("readAt")?;
        Ok(Self {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            body: row.try_get("body")?,
            priority: Priority::parse(&priority).unwrap_or(Priority::Normal),
            target: NoticeTarget::parse(&target)
                .ok_or_else(|| sqlx::Error::Decode(format!("unknown notice target {target}").into()))?,
            target_department_id: row.try_get("targetDepartmentId")?,
            target_group_id: row.try_get("targetGroupId")?,
            target_roles: serde_json::from_str(&roles).unwrap_or_default(),
            author_id: row.try_get("authorId")?,
            author_name: row.try_get("authorName")?,
            expires_at: row.try_get("expiresAt")?,
            is_read: read_at.is_some(),
            read_at,
            created_at: row.try_get("createdAt")?,
            updated_at: row.try_get("updatedAt")?,
        })
    }

    pub fn audience(&self) -> Audience {
        Audience {
            target: self.target,
            department_id: self.target_department_id.clone(),
            group_id: self.target_group_id.clone(),
            roles: self.target_roles.clone(),
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

#[derive(Debug, Clone)]
pub struct NewNotice {
    pub title: String,
    pub body: String,
    pub priority: Priority,
    pub audience: Audience,
    pub author_id: String,
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct NoticeChanges {
    pub title: Option<String>,
    pub body: Option<String>,
    pub priority: Option<Priority>,
    pub audience: Option<Audience>,
    pub expires_at: Option<Option<i64>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoticeReader {
    pub user_id: String,
    pub username: String,
    pub role: String,
    #[serde(serialize_with = "serialize_ms")]
    pub read_at: i64,
}

fn notice_select(viewer_id: &str) -> QueryBuilder<'static, Sqlite> {
    let mut builder = QueryBuilder::new(
        r#"
        SELECT n.*, u."username" AS "authorName", r."readAt" AS "readAt"
        FROM "notices" n
        LEFT JOIN "users" u ON u."id" = n."authorId"
        LEFT JOIN "notice_reads" r ON r."noticeId" = n."id" AND r."userId" = "#,
    );
    builder.push_bind(viewer_id.to_string());
    builder.push(" WHERE 1");
    builder
}

/// Appends the audience filter for `recipient`. Authors always see their own notices,
/// expired or not; everyone else only sees unexpired notices that target them.
fn push_visibility(builder: &mut QueryBuilder<'_, Sqlite>, recipient: &Recipient, now: i64) {
    builder
        .push(r#" AND (n."authorId" = "#)
        .push_bind(recipient.user_id.clone())
        .push(r#" OR ((n."expiresAt" IS NULL OR n."expiresAt" > "#)
        .push_bind(now)
        .push(r#") AND (n."target" = 'ALL'"#);

    if let Some(department_id) = &recipient.department_id {
        builder
            .push(r#" OR (n."target" = 'DEPARTMENT' AND n."targetDepartmentId" = "#)
            .push_bind(department_id.clone())
            .push(")");
    }

    let mut groups: Vec<String> = recipient.taught_group_ids.clone();
    if let Some(group_id) = &recipient.group_id {
        groups.push(group_id.clone());
    }
    if !groups.is_empty() {
        builder.push(r#" OR (n."target" = 'GROUP' AND n."targetGroupId" IN ("#);
        let mut separated = builder.separated(", ");
        for group_id in groups {
            separated.push_bind(group_id);
        }
        separated.push_unseparated("))");
    }

    builder
        .push(
            r#" OR (n."target" = 'ROLES' AND EXISTS (SELECT 1 FROM json_each(n."targetRoles") WHERE json_each.value = "#,
        )
        .push_bind(recipient.role.as_str())
        .push(r#") AND (n."targetDepartmentId" IS NULL"#);
    if let Some(department_id) = &recipient.department_id {
        builder
            .push(r#" OR n."targetDepartmentId" = "#)
            .push_bind(department_id.clone());
    }
    builder.push("))");

    builder.push(")))");
}

pub async fn insert_notice(proxy: &DatabaseProxy, notice: NewNotice) -> Result<Notice, sqlx::Error> {
    let id = Uuid::new_v4().to_string();
    let now = now_ms();
    sqlx::query(
        r#"
        INSERT INTO "notices" (
            "id", "title", "body", "priority", "target", "targetDepartmentId", "targetGroupId",
            "targetRoles", "authorId", "expiresAt", "createdAt", "updatedAt"
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(notice.title.trim())
    .bind(&notice.body)
    .bind(notice.priority.as_str())
    .bind(notice.audience.target.as_str())
    .bind(&notice.audience.department_id)
    .bind(&notice.audience.group_id)
    .bind(roles_json(&notice.audience.roles))
    .bind(&notice.author_id)
    .bind(notice.expires_at)
    .bind(now)
    .bind(now)
    .execute(proxy.pool())
    .await?;

    find_notice(proxy, &id, &notice.author_id)
        .await?
        .ok_or(sqlx::Error::RowNotFound)
}

fn roles_json(roles: &[Role]) -> String {
    serde_json::to_string(roles).unwrap_or_else(|_| "[]".to_string())
}

/// Loads a notice with `isRead` from the point of view of `viewer_id`. No visibility check.
pub async fn find_notice(
    proxy: &DatabaseProxy,
    id: &str,
    viewer_id: &str,
) -> Result<Option<Notice>, sqlx::Error> {
    let mut builder = notice_select(viewer_id);
    builder.push(r#" AND n."id" = "#).push_bind(id.to_string());
    let row = builder.build().fetch_optional(proxy.pool()).await?;
    row.as_ref().map(Notice::from_row).transpose()
}

pub async fn list_visible(
    proxy: &DatabaseProxy,
    recipient: &Recipient,
    unread_only: bool,
) -> Result<Vec<Notice>, sqlx::Error> {
    let mut builder = notice_select(&recipient.user_id);
    push_visibility(&mut builder, recipient, now_ms());
    if unread_only {
        builder.push(r#" AND r."readAt" IS NULL"#);
    }
    builder.push(r#" ORDER BY n."createdAt" DESC, n."id""#);
    let rows = builder.build().fetch_all(proxy.pool()).await?;
    rows.iter().map(Notice::from_row).collect()
}

pub async fn unread_count(proxy: &DatabaseProxy, recipient: &Recipient) -> Result<i64, sqlx::Error> {
    let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
        r#"
        SELECT COUNT(*) FROM "notices" n
        LEFT JOIN "notice_reads" r ON r."noticeId" = n."id" AND r."userId" = "#,
    );
    builder.push_bind(recipient.user_id.clone());
    builder.push(r#" WHERE r."readAt" IS NULL"#);
    push_visibility(&mut builder, recipient, now_ms());
    builder.build_query_scalar().fetch_one(proxy.pool()).await
}

/// Returns `true` when this call created the read marker.
pub async fn mark_read(proxy: &DatabaseProxy, notice_id: &str, user_id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"INSERT OR IGNORE INTO "notice_reads" ("noticeId", "userId", "readAt") VALUES (?, ?, ?)"#,
    )
    .bind(notice_id)
    .bind(user_id)
    .bind(now_ms())
    .execute(proxy.pool())
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn mark_all_read(proxy: &DatabaseProxy, recipient: &Recipient) -> Result<u64, sqlx::Error> {
    let now = now_ms();
    let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
        r#"INSERT OR IGNORE INTO "notice_reads" ("noticeId", "userId", "readAt") SELECT n."id", "#,
    );
    builder.push_bind(recipient.user_id.clone());
    builder.push(", ");
    builder.push_bind(now);
    builder.push(r#" FROM "notices" n WHERE 1"#);
    push_visibility(&mut builder, recipient, now);
    let result = builder.build().execute(proxy.pool()).await?;
    Ok(result.rows_affected())
}

pub async fn update_notice(
    proxy: &DatabaseProxy,
    id: &str,
    viewer_id: &str,
    changes: NoticeChanges,
) -> Result<Option<Notice>, sqlx::Error> {
    let mut builder: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new(r#"UPDATE "notices" SET "updatedAt" = "#);
    builder.push_bind(now_ms());
    if let Some(title) = changes.title {
        builder.push(r#", "title" = "#).push_bind(title.trim().to_string());
    }
    if let Some(body) = changes.body {
        builder.push(r#", "body" = "#).push_bind(body);
    }
    if let Some(priority) = changes.priority {
        builder.push(r#", "priority" = "#).push_bind(priority.as_str());
    }
    if let Some(audience) = changes.audience {
        builder
            .push(r#", "target" = "#)
            .push_bind(audience.target.as_str())
            .push(r#", "targetDepartmentId" = "#)
            .push_bind(audience.department_id)
            .push(r#", "targetGroupId" = "#)
            .push_bind(audience.group_id)
            .push(r#", "targetRoles" = "#)
            .push_bind(roles_json(&audience.roles));
    }
    if let Some(expires_at) = changes.expires_at {
        builder.push(r#", "expiresAt" = "#).push_bind(expires_at);
    }
    builder.push(r#" WHERE "id" = "#).push_bind(id.to_string());
    builder.build().execute(proxy.pool()).await?;

    find_notice(proxy, id, viewer_id).await
}

pub async fn delete_notice(proxy: &DatabaseProxy, id: &str) -> Result<bool, sqlx::Error> {
    let mut tx = proxy.pool().begin().await?;
    sqlx::query(r#"DELETE FROM "notice_reads" WHERE "noticeId" = ?"#)
        .bind(id)
        .execute(&mut *tx)
        .await?;
    let result = sqlx::query(r#"DELETE FROM "notices" WHERE "id" = ?"#)
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}

pub async fn readers(proxy: &DatabaseProxy, notice_id: &str) -> Result<Vec<NoticeReader>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT r."userId", u."username", u."role", r."readAt"
        FROM "notice_reads" r
        JOIN "users" u ON u."id" = r."userId"
        WHERE r."noticeId" = ?
        ORDER BY r."readAt"
        "#,
    )
    .bind(notice_id)
    .fetch_all(proxy.pool())
    .await?;

    rows.iter()
        .map(|row| {
            Ok(NoticeReader {
                user_id: row.try_get("userId")?,
                username: row.try_get("username")?,
                role: row.try_get("role")?,
                read_at: row.try_get("readAt")?,
            })
        })
        .collect()
}

/// Every active user as a notice recipient, with the groups each teacher teaches.
pub async fn active_recipients(proxy: &DatabaseProxy) -> Result<Vec<Recipient>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT u."id", u."role", u."departmentId", u."groupId",
               (SELECT json_group_array(g."id") FROM "groups" g WHERE g."teacherId" = u."id") AS "taught"
        FROM "users" u
        WHERE u."isActive" = 1
        "#,
    )
    .fetch_all(proxy.pool())
    .await?;

    let mut recipients = Vec::with_capacity(rows.len());
    for row in &rows {
        let role: String = row.try_get("role")?;
        let Some(role) = Role::parse(&role) else {
            continue;
        };
        let taught: Option<String> = row.try_get("taught")?;
        recipients.push(Recipient {
            user_id: row.try_get("id")?,
            role,
            department_id: row.try_get("departmentId")?,
            group_id: row.try_get("groupId")?,
            taught_group_ids: taught
                .and_then(|json| serde_json::from_str(&json).ok())
                .unwrap_or_default(),
        });
    }
    Ok(recipients)
}

/// Deletes notices that expired before `cutoff_ms`, with their read markers.
pub async fn delete_expired_before(proxy: &DatabaseProxy, cutoff_ms: i64) -> Result<u64, sqlx::Error> {
    let mut tx = proxy.pool().begin().await?;
    sqlx::query(
        r#"
        DELETE FROM "notice_reads" WHERE "noticeId" IN (
            SELECT "id" FROM "notices" WHERE "expiresAt" IS NOT NULL AND "expiresAt" < ?
        )
        "#,
    )
    .bind(cutoff_ms)
    .execute(&mut *tx)
    .await?;
    let result = sqlx::query(r#"DELETE FROM "notices" WHERE "expiresAt" IS NOT NULL AND "expiresAt" < ?"#)
        .bind(cutoff_ms)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(result.rows_affected())
}
