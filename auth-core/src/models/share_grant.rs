//! Share grant model - per-resource permission levels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Permission hierarchy. Variant order is the total order:
/// `Viewer < Editor < Owner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    Viewer,
    Editor,
    Owner,
}

impl PermissionLevel {
    /// The single comparison every authorization decision goes through.
    pub fn satisfies(self, required: PermissionLevel) -> bool {
        self >= required
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionLevel::Viewer => "viewer",
            PermissionLevel::Editor => "editor",
            PermissionLevel::Owner => "owner",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "viewer" => Some(PermissionLevel::Viewer),
            "editor" => Some(PermissionLevel::Editor),
            "owner" => Some(PermissionLevel::Owner),
            _ => None,
        }
    }
}

/// Grant of a permission level on one resource to one subject.
///
/// Revocation sets `revoked_utc`; grants are never physically deleted.
#[derive(Debug, Clone)]
pub struct ShareGrant {
    pub grant_id: Uuid,
    pub subject_id: Uuid,
    pub resource_id: Uuid,
    pub level: PermissionLevel,
    pub granted_by: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
    pub revoked_utc: Option<DateTime<Utc>>,
    pub revoked_by: Option<Uuid>,
}

impl ShareGrant {
    pub fn new(
        subject_id: Uuid,
        resource_id: Uuid,
        level: PermissionLevel,
        granted_by: Option<Uuid>,
    ) -> Self {
        Self {
            grant_id: Uuid::new_v4(),
            subject_id,
            resource_id,
            level,
            granted_by,
            created_utc: Utc::now(),
            revoked_utc: None,
            revoked_by: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.revoked_utc.is_none()
    }
}

/// The minimal view of a resource the permission engine needs.
#[derive(Debug, Clone, FromRow)]
pub struct ResourceRecord {
    pub resource_id: Uuid,
    pub owner_subject_id: Uuid,
    pub created_utc: DateTime<Utc>,
    pub deleted_utc: Option<DateTime<Utc>>,
}

impl ResourceRecord {
    pub fn new(owner_subject_id: Uuid) -> Self {
        Self {
            resource_id: Uuid::new_v4(),
            owner_subject_id,
            created_utc: Utc::now(),
            deleted_utc: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_utc.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_order() {
        assert!(PermissionLevel::Viewer < PermissionLevel::Editor);
        assert!(PermissionLevel::Editor < PermissionLevel::Owner);

        assert!(PermissionLevel::Owner.satisfies(PermissionLevel::Editor));
        assert!(PermissionLevel::Editor.satisfies(PermissionLevel::Editor));
        assert!(!PermissionLevel::Viewer.satisfies(PermissionLevel::Editor));
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(PermissionLevel::parse("Editor"), Some(PermissionLevel::Editor));
        assert_eq!(PermissionLevel::parse("admin"), None);
    }

    #[test]
    fn test_grant_revocation_state() {
        let mut grant = ShareGrant::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            PermissionLevel::Viewer,
            None,
        );
        assert!(grant.is_active());

        grant.revoked_utc = Some(Utc::now());
        assert!(!grant.is_active());
    }
}
