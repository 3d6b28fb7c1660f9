//! Persistence seams. The core only sees these traits; `memory` and
//! `database` provide the implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    FamilyId, RecordState, RefreshCredentialRecord, ResourceRecord, RevocationReason, ShareGrant,
    Subject,
};
use crate::services::CoreError;
use crate::utils::PasswordHashString;

/// Read access to identities, plus the two writes the session flows need.
#[async_trait]
pub trait SubjectStore: Send + Sync {
    async fn find_by_id(&self, subject_id: Uuid) -> Result<Option<Subject>, CoreError>;

    /// Case-insensitive lookup by email or username. Soft-deleted subjects
    /// are never returned.
    async fn find_by_identifier(&self, identifier: &str) -> Result<Option<Subject>, CoreError>;

    async fn mark_password_changed(
        &self,
        subject_id: Uuid,
        password_hash: &PasswordHashString,
    ) -> Result<(), CoreError>;

    async fn record_authentication(
        &self,
        subject_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError>;
}

/// Result of a compare-and-set on a refresh record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// The record was not in the expected state; carries the state it was in.
    StateMismatch(RecordState),
    FamilyRevoked,
    NotFound,
}

/// Refresh credential records grouped into families.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Store the first record of a new family.
    async fn insert(&self, record: &RefreshCredentialRecord) -> Result<(), CoreError>;

    async fn find_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshCredentialRecord>, CoreError>;

    /// Move `record_id` from `expected` to `new_state` and, in the same
    /// atomic step, insert `successor` into the same family.
    ///
    /// Must serialize against `revoke_family` on the same family: a
    /// revocation either sees the successor or prevents it.
    async fn atomic_transition(
        &self,
        record_id: Uuid,
        expected: RecordState,
        new_state: RecordState,
        successor: Option<&RefreshCredentialRecord>,
    ) -> Result<TransitionOutcome, CoreError>;

    /// Revoke every record of a family. Returns how many records changed.
    async fn revoke_family(
        &self,
        family_id: FamilyId,
        reason: RevocationReason,
    ) -> Result<u64, CoreError>;

    /// Revoke every live family of a subject. Returns the families revoked.
    async fn revoke_subject_families(
        &self,
        subject_id: Uuid,
        reason: RevocationReason,
    ) -> Result<Vec<FamilyId>, CoreError>;

    /// All records of a family ordered by generation.
    async fn family_records(
        &self,
        family_id: FamilyId,
    ) -> Result<Vec<RefreshCredentialRecord>, CoreError>;

    async fn active_records_for_subject(
        &self,
        subject_id: Uuid,
    ) -> Result<Vec<RefreshCredentialRecord>, CoreError>;
}

/// Read access to resources and their share grants.
#[async_trait]
pub trait GrantStore: Send + Sync {
    async fn find_resource(&self, resource_id: Uuid) -> Result<Option<ResourceRecord>, CoreError>;

    async fn find_active_grant(
        &self,
        subject_id: Uuid,
        resource_id: Uuid,
    ) -> Result<Option<ShareGrant>, CoreError>;

    /// Every grant ever made to `subject_id` on `resource_id`, revoked ones
    /// included, oldest first.
    async fn grant_history(
        &self,
        subject_id: Uuid,
        resource_id: Uuid,
    ) -> Result<Vec<ShareGrant>, CoreError>;
}
