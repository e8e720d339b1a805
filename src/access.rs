//! Role model and the per-request visibility scope derived from it.
//!
//! Every list query narrows its `WHERE` clause through [`AccessScope::push_filter`],
//! and every single-row handler checks the row with one of the `can_*` predicates.
//! Rows outside the scope are reported as missing rather than forbidden.

use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite};

use crate::auth::AuthUser;
use crate::db::DatabaseProxy;
use crate::response::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Hod,
    Teacher,
    Student,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::Hod => "HOD",
            Role::Teacher => "TEACHER",
            Role::Student => "STUDENT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ADMIN" => Some(Role::Admin),
            "HOD" => Some(Role::Hod),
            "TEACHER" => Some(Role::Teacher),
            "STUDENT" => Some(Role::Student),
            _ => None,
        }
    }

    pub fn is_staff(self) -> bool {
        !matches!(self, Role::Student)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn require_role(user: &AuthUser, allowed: &[Role]) -> Result<(), AppError> {
    if allowed.contains(&user.role) {
        Ok(())
    } else {
        Err(AppError::forbidden("Your role is not allowed to perform this action"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessScope {
    All,
    Department {
        department_id: Option<String>,
    },
    Teaching {
        department_id: Option<String>,
        group_ids: Vec<String>,
    },
    Student {
        user_id: String,
        department_id: Option<String>,
        group_id: Option<String>,
    },
}

/// Which column set a list query filters on.
#[derive(Debug, Clone, Copy)]
pub struct ScopeColumns {
    pub department: &'static str,
    pub group: Option<&'static str>,
}

impl AccessScope {
    pub async fn resolve(proxy: &DatabaseProxy, user: &AuthUser) -> Result<Self, AppError> {
        let scope = match user.role {
            Role::Admin => AccessScope::All,
            Role::Hod => AccessScope::Department {
                department_id: user.department_id.clone(),
            },
            Role::Teacher => {
                let group_ids =
                    crate::db::operations::groups::group_ids_taught_by(proxy, &user.id).await?;
                AccessScope::Teaching {
                    department_id: user.department_id.clone(),
                    group_ids,
                }
            }
            Role::Student => AccessScope::Student {
                user_id: user.id.clone(),
                department_id: user.department_id.clone(),
                group_id: user.group_id.clone(),
            },
        };
        Ok(scope)
    }

    pub fn department_id(&self) -> Option<&str> {
        match self {
            AccessScope::All => None,
            AccessScope::Department { department_id }
            | AccessScope::Teaching { department_id, .. }
            | AccessScope::Student { department_id, .. } => department_id.as_deref(),
        }
    }

    pub fn is_student(&self) -> bool {
        matches!(self, AccessScope::Student { .. })
    }

    pub fn can_see_department(&self, department_id: &str) -> bool {
        match self {
            AccessScope::All => true,
            _ => self.department_id() == Some(department_id),
        }
    }

    pub fn can_manage_department(&self, department_id: &str) -> bool {
        match self {
            AccessScope::All => true,
            AccessScope::Department { department_id: own } => {
                own.as_deref() == Some(department_id)
            }
            _ => false,
        }
    }

    pub fn can_see_group(&self, group_id: &str, department_id: &str) -> bool {
        match self {
            AccessScope::All => true,
            AccessScope::Department { .. } | AccessScope::Teaching { .. } => {
                self.can_see_department(department_id)
            }
            AccessScope::Student { group_id: own, .. } => own.as_deref() == Some(group_id),
        }
    }

    pub fn teaches(&self, group_id: &str) -> bool {
        match self {
            AccessScope::Teaching { group_ids, .. } => group_ids.iter().any(|id| id == group_id),
            _ => false,
        }
    }

    /// Whether the caller may create or edit course content for this department and group.
    /// Department-wide content (`group_id == None`) is open to every teacher of the department.
    pub fn can_author(&self, department_id: &str, group_id: Option<&str>) -> bool {
        match self {
            AccessScope::All => true,
            AccessScope::Department { .. } => self.can_see_department(department_id),
            AccessScope::Teaching { .. } => {
                self.can_see_department(department_id)
                    && group_id.map_or(true, |group| self.teaches(group))
            }
            AccessScope::Student { .. } => false,
        }
    }

    pub fn can_view_content(
        &self,
        department_id: &str,
        group_id: Option<&str>,
        is_published: bool,
    ) -> bool {
        match self {
            AccessScope::Student { group_id: own, .. } => {
                is_published
                    && self.can_see_department(department_id)
                    && group_id.map_or(true, |group| own.as_deref() == Some(group))
            }
            _ => self.can_see_department(department_id),
        }
    }

    pub fn can_view_student(
        &self,
        student_id: &str,
        department_id: Option<&str>,
        group_id: Option<&str>,
    ) -> bool {
        match self {
            AccessScope::All => true,
            AccessScope::Department { department_id: own } => {
                own.is_some() && own.as_deref() == department_id
            }
            AccessScope::Teaching { .. } => group_id.map_or(false, |group| self.teaches(group)),
            AccessScope::Student { user_id, .. } => user_id == student_id,
        }
    }

    /// Appends ` AND (...)` restricting rows to this scope. Content tables pass
    /// `published` so students only see published rows.
    pub fn push_filter(
        &self,
        builder: &mut QueryBuilder<'_, Sqlite>,
        columns: ScopeColumns,
        published: Option<&'static str>,
    ) {
        match self {
            AccessScope::All => {}
            AccessScope::Department { department_id }
            | AccessScope::Teaching { department_id, .. } => {
                push_department(builder, columns.department, department_id.clone());
            }
            AccessScope::Student {
                department_id,
                group_id,
                ..
            } => {
                push_department(builder, columns.department, department_id.clone());
                if let Some(published) = published {
                    builder.push(format!(r#" AND {published} = 1"#));
                }
                if let Some(group_column) = columns.group {
                    match group_id {
                        Some(group_id) => {
                            builder.push(format!(
                                r#" AND ({group_column} IS NULL OR {group_column} = "#
                            ));
                            builder.push_bind(group_id.clone());
                            builder.push(")");
                        }
                        None => {
                            builder.push(format!(r#" AND {group_column} IS NULL"#));
                        }
                    }
                }
            }
        }
    }
}

fn push_department(
    builder: &mut QueryBuilder<'_, Sqlite>,
    column: &'static str,
    department_id: Option<String>,
) {
    match department_id {
        Some(department_id) => {
            builder.push(format!(" AND {column} = "));
            builder.push_bind(department_id);
        }
        // Unassigned staff and students see nothing department-scoped.
        None => {
            builder.push(" AND 0");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn teacher() -> AccessScope {
        AccessScope::Teaching {
            department_id: Some("cs".to_string()),
            group_ids: vec!["g1".to_string()],
        }
    }

    fn student() -> AccessScope {
        AccessScope::Student {
            user_id: "s1".to_string(),
            department_id: Some("cs".to_string()),
            group_id: Some("g1".to_string()),
        }
    }

    #[test]
    fn role_parsing_is_case_insensitive() {
        assert_eq!(Role::parse("hod"), Some(Role::Hod));
        assert_eq!(Role::parse(" Student "), Some(Role::Student));
        assert_eq!(Role::parse("dean"), None);
        assert!(Role::Teacher.is_staff());
        assert!(!Role::Student.is_staff());
    }

    #[test]
    fn hod_manages_only_own_department() {
        let scope = AccessScope::Department {
            department_id: Some("cs".to_string()),
        };
        assert!(scope.can_manage_department("cs"));
        assert!(!scope.can_manage_department("math"));
        assert!(!teacher().can_manage_department("cs"));
        assert!(AccessScope::All.can_manage_department("math"));
    }

    #[test]
    fn teacher_authors_department_wide_or_taught_groups() {
        let scope = teacher();
        assert!(scope.can_author("cs", None));
        assert!(scope.can_author("cs", Some("g1")));
        assert!(!scope.can_author("cs", Some("g2")));
        assert!(!scope.can_author("math", None));
        assert!(!student().can_author("cs", None));
    }

    #[test]
    fn students_see_published_content_for_their_group() {
        let scope = student();
        assert!(scope.can_view_content("cs", None, true));
        assert!(scope.can_view_content("cs", Some("g1"), true));
        assert!(!scope.can_view_content("cs", Some("g2"), true));
        assert!(!scope.can_view_content("cs", None, false));
        assert!(teacher().can_view_content("cs", Some("g2"), false));
    }

    #[test]
    fn student_visibility() {
        assert!(student().can_view_student("s1", Some("cs"), Some("g1")));
        assert!(!student().can_view_student("s2", Some("cs"), Some("g1")));
        assert!(teacher().can_view_student("s2", Some("cs"), Some("g1")));
        assert!(!teacher().can_view_student("s3", Some("cs"), Some("g2")));
        let unassigned_hod = AccessScope::Department { department_id: None };
        assert!(!unassigned_hod.can_view_student("s3", None, None));
    }

    #[test]
    fn student_filter_restricts_group_and_publication() {
        let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new("SELECT 1 FROM t WHERE 1");
        student().push_filter(
            &mut builder,
            ScopeColumns {
                department: r#""departmentId""#,
                group: Some(r#""groupId""#),
            },
            Some(r#""isPublished""#),
        );
        let sql = builder.sql();
        assert!(sql.contains(r#""departmentId" = ?"#));
        assert!(sql.contains(r#""isPublished" = 1"#));
        assert!(sql.contains(r#"("groupId" IS NULL OR "groupId" = ?)"#));
    }
}
