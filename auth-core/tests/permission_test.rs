//! Resource permission checks through the assembled core.

mod common;

use auth_core::models::{AuditEventType, PermissionLevel, Severity};
use auth_core::services::{AccessDecision, AuthFailure, GrantStore};
use common::TestCore;
use uuid::Uuid;

#[tokio::test]
async fn test_shared_document_levels() {
    let t = TestCore::new();
    let owner = t.add_subject("olivia", "Owner-Pass-123", false);
    let editor = t.add_subject("eddie", "Editor-Pass-123", false);
    let viewer = t.add_subject("vera", "Viewer-Pass-123", false);
    let permissions = &t.core.permissions;

    let doc = t.store.create_resource(owner).resource_id;
    t.store.put_grant(editor, doc, PermissionLevel::Editor, owner);
    t.store.put_grant(viewer, doc, PermissionLevel::Viewer, owner);

    let cases = [
        (owner, PermissionLevel::Owner, true),
        (editor, PermissionLevel::Editor, true),
        (editor, PermissionLevel::Owner, false),
        (viewer, PermissionLevel::Viewer, true),
        (viewer, PermissionLevel::Editor, false),
    ];
    for (subject, required, expected) in cases {
        assert_eq!(
            permissions.authorize(subject, doc, required).await.unwrap(),
            expected,
            "{:?} on {:?}",
            subject,
            required
        );
    }

    assert_eq!(
        permissions.ensure_can_manage_grants(editor, doc).await.unwrap(),
        Err(AuthFailure::PermissionDenied)
    );
    assert_eq!(
        permissions.effective_level(viewer, doc).await.unwrap(),
        Some(PermissionLevel::Viewer)
    );
}

#[tokio::test]
async fn test_admin_override_is_flagged() {
    let t = TestCore::new();
    let owner = t.add_subject("olivia", "Owner-Pass-123", false);
    let admin = t.add_subject("root", "Admin-Pass-123", true);
    let doc = t.store.create_resource(owner).resource_id;

    let decision = t
        .core
        .permissions
        .require(admin, doc, PermissionLevel::Editor)
        .await
        .unwrap();
    assert_eq!(decision, Ok(AccessDecision::AdminOverride));

    let overrides = t.audit.events_of(AuditEventType::AuthzAdminOverride);
    assert_eq!(overrides.len(), 1);
    assert_eq!(overrides[0].severity, Severity::Warning);
    assert_eq!(overrides[0].context["resource_id"], doc.to_string());
    assert_eq!(overrides[0].context["required"], "editor");
}

#[tokio::test]
async fn test_revoked_grant_denies_but_keeps_history() {
    let t = TestCore::new();
    let owner = t.add_subject("olivia", "Owner-Pass-123", false);
    let bob = t.add_subject("bob", "Bob-Pass-1234", false);
    let doc = t.store.create_resource(owner).resource_id;

    t.store.put_grant(bob, doc, PermissionLevel::Editor, owner);
    assert!(t
        .core
        .permissions
        .authorize(bob, doc, PermissionLevel::Editor)
        .await
        .unwrap());

    assert!(t.store.revoke_grant(bob, doc, owner));
    assert_eq!(
        t.core
            .permissions
            .decide(bob, doc, PermissionLevel::Viewer)
            .await
            .unwrap(),
        AccessDecision::Denied(None)
    );

    let history = t.store.grant_history(bob, doc).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].level, PermissionLevel::Editor);
    assert_eq!(history[0].revoked_by, Some(owner));

    // A fresh grant after revocation is a new row.
    t.store.put_grant(bob, doc, PermissionLevel::Viewer, owner);
    assert_eq!(t.store.grant_history(bob, doc).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_missing_and_deleted_resources_deny_everyone() {
    let t = TestCore::new();
    let owner = t.add_subject("olivia", "Owner-Pass-123", false);
    let admin = t.add_subject("root", "Admin-Pass-123", true);
    let doc = t.store.create_resource(owner).resource_id;
    assert!(t.store.delete_resource(doc));

    for resource in [doc, Uuid::new_v4()] {
        for subject in [owner, admin] {
            let decision = t
                .core
                .permissions
                .decide(subject, resource, PermissionLevel::Viewer)
                .await
                .unwrap();
            assert_eq!(decision, AccessDecision::Denied(None));
        }
    }

    let denied = t.audit.events_of(AuditEventType::AuthzDenied);
    assert_eq!(denied.len(), 4);
    assert!(denied
        .iter()
        .all(|e| e.context["reason"] == "resource_not_found"));
}
