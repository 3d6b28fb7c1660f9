//! Per-resource authorization.
//!
//! Every decision goes through [`PermissionLevel::satisfies`]. Administrator
//! bypass happens here and nowhere else, and is audited as its own event.

use std::sync::Arc;

use uuid::Uuid;

use crate::models::{AuditEvent, AuditEventType, AuditOutcome, PermissionLevel, ResourceRecord};
use crate::services::security_audit::AuditSink;
use crate::services::store::{GrantStore, SubjectStore};
use crate::services::{AuthFailure, AuthResult, CoreError};

/// Outcome of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    /// The subject's own level satisfies the requirement.
    Granted(PermissionLevel),
    /// The subject's level does not, but it is an administrator.
    AdminOverride,
    /// Denied; carries whatever level the subject holds.
    Denied(Option<PermissionLevel>),
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, AccessDecision::Denied(_))
    }
}

#[derive(Clone)]
pub struct PermissionEngine {
    grants: Arc<dyn GrantStore>,
    subjects: Arc<dyn SubjectStore>,
    audit: Arc<dyn AuditSink>,
}

impl PermissionEngine {
    pub fn new(
        grants: Arc<dyn GrantStore>,
        subjects: Arc<dyn SubjectStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            grants,
            subjects,
            audit,
        }
    }

    /// The level granted to `subject_id` on `resource_id`.
    ///
    /// `None` for a missing or deleted resource. Administrator status does
    /// not raise this value.
    pub async fn effective_level(
        &self,
        subject_id: Uuid,
        resource_id: Uuid,
    ) -> Result<Option<PermissionLevel>, CoreError> {
        match self.live_resource(resource_id).await? {
            Some(resource) => self.level_on(&resource, subject_id).await,
            None => Ok(None),
        }
    }

    /// Decide and audit.
    pub async fn decide(
        &self,
        subject_id: Uuid,
        resource_id: Uuid,
        required: PermissionLevel,
    ) -> Result<AccessDecision, CoreError> {
        let Some(resource) = self.live_resource(resource_id).await? else {
            let decision = AccessDecision::Denied(None);
            self.record(subject_id, resource_id, required, decision, Some("resource_not_found"));
            return Ok(decision);
        };

        let held = self.level_on(&resource, subject_id).await?;
        let decision = match held {
            Some(level) if level.satisfies(required) => AccessDecision::Granted(level),
            _ => {
                if self.is_admin(subject_id).await? {
                    AccessDecision::AdminOverride
                } else {
                    AccessDecision::Denied(held)
                }
            }
        };

        self.record(subject_id, resource_id, required, decision, None);
        Ok(decision)
    }

    pub async fn authorize(
        &self,
        subject_id: Uuid,
        resource_id: Uuid,
        required: PermissionLevel,
    ) -> Result<bool, CoreError> {
        Ok(self
            .decide(subject_id, resource_id, required)
            .await?
            .is_allowed())
    }

    /// Like [`Self::authorize`] but a denial is an [`AuthFailure::PermissionDenied`].
    pub async fn require(
        &self,
        subject_id: Uuid,
        resource_id: Uuid,
        required: PermissionLevel,
    ) -> AuthResult<AccessDecision> {
        let decision = self.decide(subject_id, resource_id, required).await?;
        if decision.is_allowed() {
            Ok(Ok(decision))
        } else {
            Ok(Err(AuthFailure::PermissionDenied))
        }
    }

    /// Granting and revoking shares needs owner level on the resource.
    pub async fn ensure_can_manage_grants(
        &self,
        actor_id: Uuid,
        resource_id: Uuid,
    ) -> AuthResult<AccessDecision> {
        self.require(actor_id, resource_id, PermissionLevel::Owner)
            .await
    }

    async fn live_resource(&self, resource_id: Uuid) -> Result<Option<ResourceRecord>, CoreError> {
        Ok(self
            .grants
            .find_resource(resource_id)
            .await?
            .filter(|r| !r.is_deleted()))
    }

    async fn level_on(
        &self,
        resource: &ResourceRecord,
        subject_id: Uuid,
    ) -> Result<Option<PermissionLevel>, CoreError> {
        if let Some(grant) = self
            .grants
            .find_active_grant(subject_id, resource.resource_id)
            .await?
        {
            return Ok(Some(grant.level));
        }

        // Creators with no grant history at all are implicit owners. A
        // creator whose grant was revoked stays revoked.
        if resource.owner_subject_id == subject_id
            && self
                .grants
                .grant_history(subject_id, resource.resource_id)
                .await?
                .is_empty()
        {
            return Ok(Some(PermissionLevel::Owner));
        }

        Ok(None)
    }

    async fn is_admin(&self, subject_id: Uuid) -> Result<bool, CoreError> {
        Ok(self
            .subjects
            .find_by_id(subject_id)
            .await?
            .is_some_and(|s| s.is_usable() && s.admin_flag))
    }

    fn record(
        &self,
        subject_id: Uuid,
        resource_id: Uuid,
        required: PermissionLevel,
        decision: AccessDecision,
        reason: Option<&str>,
    ) {
        let (event_type, outcome, held) = match decision {
            AccessDecision::Granted(level) => {
                (AuditEventType::AuthzGranted, AuditOutcome::Success, Some(level))
            }
            AccessDecision::AdminOverride => {
                tracing::warn!(
                    subject_id = %subject_id,
                    resource_id = %resource_id,
                    required = required.as_str(),
                    "Administrator override"
                );
                (AuditEventType::AuthzAdminOverride, AuditOutcome::Success, None)
            }
            AccessDecision::Denied(held) => {
                (AuditEventType::AuthzDenied, AuditOutcome::Failure, held)
            }
        };

        self.audit.emit(AuditEvent::new(
            event_type,
            Some(subject_id),
            outcome,
            serde_json::json!({
                "resource_id": resource_id,
                "required": required.as_str(),
                "held": held.map(|l| l.as_str()),
                "reason": reason,
            }),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Subject;
    use crate::services::memory::MemoryStore;
    use crate::services::security_audit::MemoryAuditSink;

    struct Fixture {
        store: Arc<MemoryStore>,
        audit: Arc<MemoryAuditSink>,
        engine: PermissionEngine,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let engine = PermissionEngine::new(store.clone(), store.clone(), audit.clone());
        Fixture {
            store,
            audit,
            engine,
        }
    }

    fn subject(store: &MemoryStore, name: &str, admin: bool) -> Uuid {
        let subject = Subject::new(
            format!("{}@example.com", name),
            name.to_string(),
            "$argon2id$stub".to_string(),
        )
        .with_admin(admin);
        let id = subject.subject_id;
        store.insert_subject(subject);
        id
    }

    #[tokio::test]
    async fn test_grant_levels() {
        let f = fixture();
        let owner = subject(&f.store, "owner", false);
        let editor = subject(&f.store, "editor", false);
        let stranger = subject(&f.store, "stranger", false);
        let doc = f.store.create_resource(owner).resource_id;
        f.store.put_grant(editor, doc, PermissionLevel::Editor, owner);

        assert!(f.engine.authorize(editor, doc, PermissionLevel::Viewer).await.unwrap());
        assert!(f.engine.authorize(editor, doc, PermissionLevel::Editor).await.unwrap());
        assert!(!f.engine.authorize(editor, doc, PermissionLevel::Owner).await.unwrap());
        assert!(f.engine.authorize(owner, doc, PermissionLevel::Owner).await.unwrap());
        assert!(!f.engine.authorize(stranger, doc, PermissionLevel::Viewer).await.unwrap());

        assert_eq!(
            f.engine.effective_level(editor, doc).await.unwrap(),
            Some(PermissionLevel::Editor)
        );
        assert_eq!(f.engine.effective_level(stranger, doc).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_admin_override_is_audited_separately() {
        let f = fixture();
        let owner = subject(&f.store, "owner", false);
        let admin = subject(&f.store, "admin", true);
        let doc = f.store.create_resource(owner).resource_id;

        let decision = f
            .engine
            .decide(admin, doc, PermissionLevel::Owner)
            .await
            .unwrap();
        assert_eq!(decision, AccessDecision::AdminOverride);
        assert_eq!(f.engine.effective_level(admin, doc).await.unwrap(), None);

        let overrides = f.audit.events_of(AuditEventType::AuthzAdminOverride);
        assert_eq!(overrides.len(), 1);
        assert_eq!(overrides[0].subject_id, Some(admin));
        assert!(f.audit.events_of(AuditEventType::AuthzGranted).is_empty());
    }

    #[tokio::test]
    async fn test_inactive_admin_gets_no_override() {
        let f = fixture();
        let owner = subject(&f.store, "owner", false);
        let admin = subject(&f.store, "admin", true);
        f.store.set_subject_active(admin, false);
        let doc = f.store.create_resource(owner).resource_id;

        assert_eq!(
            f.engine.decide(admin, doc, PermissionLevel::Viewer).await.unwrap(),
            AccessDecision::Denied(None)
        );
    }

    #[tokio::test]
    async fn test_missing_or_deleted_resource_fails_closed() {
        let f = fixture();
        let owner = subject(&f.store, "owner", false);
        let admin = subject(&f.store, "admin", true);
        let doc = f.store.create_resource(owner).resource_id;
        f.store.delete_resource(doc);

        for actor in [owner, admin] {
            assert_eq!(
                f.engine.decide(actor, doc, PermissionLevel::Viewer).await.unwrap(),
                AccessDecision::Denied(None)
            );
            assert!(!f
                .engine
                .authorize(actor, Uuid::new_v4(), PermissionLevel::Viewer)
                .await
                .unwrap());
        }
        assert_eq!(f.engine.effective_level(owner, doc).await.unwrap(), None);

        let denied = f.audit.events_of(AuditEventType::AuthzDenied);
        assert_eq!(denied.len(), 4);
        assert_eq!(denied[0].context["reason"], "resource_not_found");
    }

    #[tokio::test]
    async fn test_require_and_manage_grants() {
        let f = fixture();
        let owner = subject(&f.store, "owner", false);
        let viewer = subject(&f.store, "viewer", false);
        let doc = f.store.create_resource(owner).resource_id;
        f.store.put_grant(viewer, doc, PermissionLevel::Viewer, owner);

        assert_eq!(
            f.engine.require(viewer, doc, PermissionLevel::Viewer).await.unwrap(),
            Ok(AccessDecision::Granted(PermissionLevel::Viewer))
        );
        assert_eq!(
            f.engine.require(viewer, doc, PermissionLevel::Editor).await.unwrap(),
            Err(AuthFailure::PermissionDenied)
        );
        assert!(f.engine.ensure_can_manage_grants(owner, doc).await.unwrap().is_ok());
        assert_eq!(
            f.engine.ensure_can_manage_grants(viewer, doc).await.unwrap(),
            Err(AuthFailure::PermissionDenied)
        );
    }

    #[tokio::test]
    async fn test_revoked_owner_grant_is_not_restored() {
        let f = fixture();
        let owner = subject(&f.store, "owner", false);
        let doc = f.store.create_resource(owner).resource_id;
        f.store.revoke_grant(owner, doc, owner);

        assert_eq!(f.engine.effective_level(owner, doc).await.unwrap(), None);
    }
}
