//! Notice targeting.
//!
//! A notice names its audience with a [`NoticeTarget`] plus the department, group or role
//! set that target needs. The same rules back the SQL visibility filter in
//! `db::operations::notices` and the in-memory checks here.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::access::{AccessScope, Role};
use crate::auth::AuthUser;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NoticeTarget {
    All,
    Department,
    Group,
    Roles,
}

impl NoticeTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            NoticeTarget::All => "ALL",
            NoticeTarget::Department => "DEPARTMENT",
            NoticeTarget::Group => "GROUP",
            NoticeTarget::Roles => "ROLES",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ALL" => Some(NoticeTarget::All),
            "DEPARTMENT" => Some(NoticeTarget::Department),
            "GROUP" => Some(NoticeTarget::Group),
            "ROLES" => Some(NoticeTarget::Roles),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Urgent => "URGENT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "LOW" => Some(Priority::Low),
            "NORMAL" => Some(Priority::Normal),
            "HIGH" => Some(Priority::High),
            "URGENT" => Some(Priority::Urgent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NoticeError {
    #[error("targetDepartmentId is required for DEPARTMENT notices")]
    MissingDepartment,
    #[error("targetGroupId is required for GROUP notices")]
    MissingGroup,
    #[error("targetRoles must name at least one role")]
    EmptyRoles,
    #[error("expiresAt must be in the future")]
    ExpiryInPast,
    #[error("{0}")]
    NotAllowed(&'static str),
}

/// Who a notice is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Audience {
    pub target: NoticeTarget,
    pub department_id: Option<String>,
    pub group_id: Option<String>,
    pub roles: Vec<Role>,
}

impl Audience {
    /// Drops fields the target does not use and rejects incomplete targets.
    pub fn normalized(mut self) -> Result<Self, NoticeError> {
        self.roles.sort_by_key(|role| role.as_str());
        self.roles.dedup();
        match self.target {
            NoticeTarget::All => {
                self.department_id = None;
                self.group_id = None;
                self.roles.clear();
            }
            NoticeTarget::Department => {
                if self.department_id.is_none() {
                    return Err(NoticeError::MissingDepartment);
                }
                self.group_id = None;
                self.roles.clear();
            }
            NoticeTarget::Group => {
                if self.group_id.is_none() {
                    return Err(NoticeError::MissingGroup);
                }
                self.department_id = None;
                self.roles.clear();
            }
            NoticeTarget::Roles => {
                if self.roles.is_empty() {
                    return Err(NoticeError::EmptyRoles);
                }
                self.group_id = None;
            }
        }
        Ok(self)
    }

    pub fn includes(&self, recipient: &Recipient) -> bool {
        match self.target {
            NoticeTarget::All => true,
            NoticeTarget::Department => {
                recipient.department_id.is_some() && recipient.department_id == self.department_id
            }
            NoticeTarget::Group => match &self.group_id {
                Some(group_id) => {
                    recipient.group_id.as_ref() == Some(group_id)
                        || recipient.taught_group_ids.contains(group_id)
                }
                None => false,
            },
            NoticeTarget::Roles => {
                self.roles.contains(&recipient.role)
                    && self
                        .department_id
                        .as_ref()
                        .map_or(true, |dept| recipient.department_id.as_ref() == Some(dept))
            }
        }
    }

    /// Whether `author` may address this audience. `group_department_id` is the
    /// department of the targeted group when the target is `GROUP`.
    pub fn check_author(
        &self,
        author: &AccessScope,
        group_department_id: Option<&str>,
    ) -> Result<(), NoticeError> {
        match author {
            AccessScope::All => Ok(()),
            AccessScope::Department { department_id } => {
                let own = department_id
                    .as_deref()
                    .ok_or(NoticeError::NotAllowed("HOD accounts without a department cannot post notices"))?;
                let allowed = match self.target {
                    NoticeTarget::All => false,
                    NoticeTarget::Department => self.department_id.as_deref() == Some(own),
                    NoticeTarget::Group => group_department_id == Some(own),
                    NoticeTarget::Roles => self.department_id.as_deref() == Some(own),
                };
                if allowed {
                    Ok(())
                } else {
                    Err(NoticeError::NotAllowed(
                        "HODs may only post notices to their own department",
                    ))
                }
            }
            AccessScope::Teaching { .. } => match (self.target, &self.group_id) {
                (NoticeTarget::Group, Some(group_id)) if author.teaches(group_id) => Ok(()),
                _ => Err(NoticeError::NotAllowed(
                    "Teachers may only post notices to groups they teach",
                )),
            },
            AccessScope::Student { .. } => {
                Err(NoticeError::NotAllowed("Students cannot post notices"))
            }
        }
    }
}

/// The attributes of a user that notice targeting looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub user_id: String,
    pub role: Role,
    pub department_id: Option<String>,
    pub group_id: Option<String>,
    pub taught_group_ids: Vec<String>,
}

impl Recipient {
    pub fn from_user(user: &AuthUser, scope: &AccessScope) -> Self {
        let taught_group_ids = match scope {
            AccessScope::Teaching { group_ids, .. } => group_ids.clone(),
            _ => Vec::new(),
        };
        Self {
            user_id: user.id.clone(),
            role: user.role,
            department_id: user.department_id.clone(),
            group_id: user.group_id.clone(),
            taught_group_ids,
        }
    }
}

pub fn check_expiry(expires_at: Option<i64>, now: i64) -> Result<(), NoticeError> {
    match expires_at {
        Some(at) if at <= now => Err(NoticeError::ExpiryInPast),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipient(role: Role, dept: Option<&str>, group: Option<&str>) -> Recipient {
        Recipient {
            user_id: "u".to_string(),
            role,
            department_id: dept.map(str::to_string),
            group_id: group.map(str::to_string),
            taught_group_ids: Vec::new(),
        }
    }

    fn audience(target: NoticeTarget) -> Audience {
        Audience {
            target,
            department_id: None,
            group_id: None,
            roles: Vec::new(),
        }
    }

    #[test]
    fn department_target_requires_matching_department() {
        let notice = Audience {
            department_id: Some("cs".to_string()),
            ..audience(NoticeTarget::Department)
        };
        assert!(notice.includes(&recipient(Role::Student, Some("cs"), None)));
        assert!(!notice.includes(&recipient(Role::Student, Some("math"), None)));
        assert!(!notice.includes(&recipient(Role::Admin, None, None)));
    }

    #[test]
    fn group_target_reaches_members_and_their_teacher() {
        let notice = Audience {
            group_id: Some("g1".to_string()),
            ..audience(NoticeTarget::Group)
        };
        assert!(notice.includes(&recipient(Role::Student, Some("cs"), Some("g1"))));
        assert!(!notice.includes(&recipient(Role::Student, Some("cs"), Some("g2"))));
        let mut teacher = recipient(Role::Teacher, Some("cs"), None);
        teacher.taught_group_ids = vec!["g1".to_string()];
        assert!(notice.includes(&teacher));
    }

    #[test]
    fn role_target_may_be_narrowed_to_a_department() {
        let notice = Audience {
            roles: vec![Role::Teacher, Role::Hod],
            department_id: Some("cs".to_string()),
            ..audience(NoticeTarget::Roles)
        };
        assert!(notice.includes(&recipient(Role::Teacher, Some("cs"), None)));
        assert!(!notice.includes(&recipient(Role::Teacher, Some("math"), None)));
        assert!(!notice.includes(&recipient(Role::Student, Some("cs"), None)));

        let everywhere = Audience {
            department_id: None,
            ..notice
        };
        assert!(everywhere.includes(&recipient(Role::Teacher, Some("math"), None)));
    }

    #[test]
    fn normalization_rejects_incomplete_targets() {
        assert_eq!(
            audience(NoticeTarget::Department).normalized(),
            Err(NoticeError::MissingDepartment)
        );
        assert_eq!(
            audience(NoticeTarget::Group).normalized(),
            Err(NoticeError::MissingGroup)
        );
        assert_eq!(
            audience(NoticeTarget::Roles).normalized(),
            Err(NoticeError::EmptyRoles)
        );
        let all = Audience {
            department_id: Some("cs".to_string()),
            roles: vec![Role::Student],
            ..audience(NoticeTarget::All)
        }
        .normalized()
        .unwrap();
        assert_eq!(all, audience(NoticeTarget::All));
    }

    #[test]
    fn posting_rights_follow_role() {
        let hod = AccessScope::Department {
            department_id: Some("cs".to_string()),
        };
        let own_dept = Audience {
            department_id: Some("cs".to_string()),
            ..audience(NoticeTarget::Department)
        };
        assert!(own_dept.check_author(&hod, None).is_ok());
        assert!(audience(NoticeTarget::All).check_author(&hod, None).is_err());

        let group = Audience {
            group_id: Some("g1".to_string()),
            ..audience(NoticeTarget::Group)
        };
        assert!(group.check_author(&hod, Some("cs")).is_ok());
        assert!(group.check_author(&hod, Some("math")).is_err());

        let teacher = AccessScope::Teaching {
            department_id: Some("cs".to_string()),
            group_ids: vec!["g1".to_string()],
        };
        assert!(group.check_author(&teacher, Some("cs")).is_ok());
        assert!(own_dept.check_author(&teacher, None).is_err());

        let student = AccessScope::Student {
            user_id: "s".to_string(),
            department_id: Some("cs".to_string()),
            group_id: Some("g1".to_string()),
        };
        assert!(group.check_author(&student, Some("cs")).is_err());
        assert!(audience(NoticeTarget::All).check_author(&AccessScope::All, None).is_ok());
    }

    #[test]
    fn expiry_must_be_in_the_future() {
        assert!(check_expiry(None, 10).is_ok());
        assert!(check_expiry(Some(11), 10).is_ok());
        assert_eq!(check_expiry(Some(10), 10), Err(NoticeError::ExpiryInPast));
    }
}
