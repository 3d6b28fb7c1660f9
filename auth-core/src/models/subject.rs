//! Subject model - the identity that authenticates and owns resources.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Subject entity. Soft-deleted, never physically removed.
#[derive(Debug, Clone, FromRow)]
pub struct Subject {
    pub subject_id: Uuid,
    pub email: String,
    pub username: String,
    /// PHC-format argon2 hash. Never logged, never returned to clients.
    pub password_hash: String,
    pub active_flag: bool,
    pub admin_flag: bool,
    pub deleted_utc: Option<DateTime<Utc>>,
    pub last_authenticated_utc: Option<DateTime<Utc>>,
    pub password_changed_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

impl Subject {
    /// Create a new active, non-administrator subject.
    pub fn new(email: String, username: String, password_hash: String) -> Self {
        Self {
            subject_id: Uuid::new_v4(),
            email,
            username,
            password_hash,
            active_flag: true,
            admin_flag: false,
            deleted_utc: None,
            last_authenticated_utc: None,
            password_changed_utc: None,
            created_utc: Utc::now(),
        }
    }

    pub fn with_admin(mut self, admin: bool) -> Self {
        self.admin_flag = admin;
        self
    }

    /// Active and not soft-deleted.
    pub fn is_usable(&self) -> bool {
        self.active_flag && self.deleted_utc.is_none()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_utc.is_some()
    }

    /// Email, compared after [`fold_identifier`].
    pub fn matches_email(&self, identifier: &str) -> bool {
        fold_identifier(&self.email) == fold_identifier(identifier)
    }

    /// Email or username, case-insensitive.
    pub fn matches_identifier(&self, identifier: &str) -> bool {
        let folded = fold_identifier(identifier);
        fold_identifier(&self.email) == folded || fold_identifier(&self.username) == folded
    }
}

/// Case folding applied to emails and usernames before comparison. Both
/// stores match on this, never on database collation.
pub fn fold_identifier(identifier: &str) -> String {
    identifier.to_lowercase()
}
