//! In-process store implementations for tests and single-node embedding.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::models::{
    FamilyId, PermissionLevel, RecordState, RefreshCredentialRecord, ResourceRecord,
    RevocationReason, ShareGrant, Subject,
};
use crate::services::store::{GrantStore, SubjectStore, TokenStore, TransitionOutcome};
use crate::services::CoreError;
use crate::utils::PasswordHashString;

struct FamilyEntry {
    subject_id: Uuid,
    records: Vec<Uuid>,
    revoked_utc: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct TokenTables {
    records: HashMap<Uuid, RefreshCredentialRecord>,
    by_hash: HashMap<String, Uuid>,
    families: HashMap<FamilyId, FamilyEntry>,
}

impl TokenTables {
    fn revoke_family(&mut self, family_id: FamilyId, reason: RevocationReason) -> u64 {
        let now = Utc::now();
        let Some(family) = self.families.get_mut(&family_id) else {
            return 0;
        };
        if family.revoked_utc.is_none() {
            family.revoked_utc = Some(now);
        }

        let mut changed = 0;
        for record_id in &family.records {
            if let Some(record) = self.records.get_mut(record_id) {
                if record.state != RecordState::Revoked {
                    record.state = RecordState::Revoked;
                    record.revocation_reason = Some(reason);
                    record.revoked_utc = Some(now);
                    changed += 1;
                }
            }
        }
        changed
    }

    fn push(&mut self, record: RefreshCredentialRecord) -> Result<(), CoreError> {
        if self.by_hash.contains_key(&record.token_hash) {
            return Err(CoreError::Store(anyhow!(
                "Refresh credential hash already stored"
            )));
        }
        self.by_hash.insert(record.token_hash.clone(), record.record_id);
        self.records.insert(record.record_id, record);
        Ok(())
    }
}

/// Thread-safe in-memory store implementing every store trait.
///
/// Subjects and grants live in concurrent maps. Refresh records share a
/// single mutex, which is what makes `atomic_transition` and
/// `revoke_family` mutually exclusive.
#[derive(Default)]
pub struct MemoryStore {
    subjects: DashMap<Uuid, Subject>,
    tokens: Mutex<TokenTables>,
    resources: DashMap<Uuid, ResourceRecord>,
    grants: DashMap<(Uuid, Uuid), Vec<ShareGrant>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_tokens(&self) -> Result<MutexGuard<'_, TokenTables>, CoreError> {
        self.tokens
            .lock()
            .map_err(|e| CoreError::Store(anyhow!("Token store lock poisoned: {}", e)))
    }

    // ==================== Subjects ====================

    pub fn insert_subject(&self, subject: Subject) {
        self.subjects.insert(subject.subject_id, subject);
    }

    pub fn set_subject_active(&self, subject_id: Uuid, active: bool) -> bool {
        match self.subjects.get_mut(&subject_id) {
            Some(mut subject) => {
                subject.active_flag = active;
                true
            }
            None => false,
        }
    }

    pub fn soft_delete_subject(&self, subject_id: Uuid) -> bool {
        match self.subjects.get_mut(&subject_id) {
            Some(mut subject) => {
                subject.deleted_utc.get_or_insert_with(Utc::now);
                true
            }
            None => false,
        }
    }

    // ==================== Resources & grants ====================

    /// Create a resource and materialize its creator's owner grant.
    pub fn create_resource(&self, owner_subject_id: Uuid) -> ResourceRecord {
        let resource = ResourceRecord::new(owner_subject_id);
        let owner_grant = ShareGrant::new(
            owner_subject_id,
            resource.resource_id,
            PermissionLevel::Owner,
            Some(owner_subject_id),
        );
        self.grants
            .insert((owner_subject_id, resource.resource_id), vec![owner_grant]);
        self.resources.insert(resource.resource_id, resource.clone());
        resource
    }

    /// Grant `level`, replacing the level of an existing active grant.
    pub fn put_grant(
        &self,
        subject_id: Uuid,
        resource_id: Uuid,
        level: PermissionLevel,
        granted_by: Uuid,
    ) -> ShareGrant {
        let mut history = self.grants.entry((subject_id, resource_id)).or_default();
        if let Some(active) = history.iter_mut().find(|g| g.is_active()) {
            active.level = level;
            active.granted_by = Some(granted_by);
            return active.clone();
        }
        let grant = ShareGrant::new(subject_id, resource_id, level, Some(granted_by));
        history.push(grant.clone());
        grant
    }

    /// Mark the active grant revoked. The grant stays in the history.
    pub fn revoke_grant(&self, subject_id: Uuid, resource_id: Uuid, revoked_by: Uuid) -> bool {
        let Some(mut history) = self.grants.get_mut(&(subject_id, resource_id)) else {
            return false;
        };
        match history.iter_mut().find(|g| g.is_active()) {
            Some(grant) => {
                grant.revoked_utc = Some(Utc::now());
                grant.revoked_by = Some(revoked_by);
                true
            }
            None => false,
        }
    }

    pub fn delete_resource(&self, resource_id: Uuid) -> bool {
        match self.resources.get_mut(&resource_id) {
            Some(mut resource) => {
                resource.deleted_utc.get_or_insert_with(Utc::now);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl SubjectStore for MemoryStore {
    async fn find_by_id(&self, subject_id: Uuid) -> Result<Option<Subject>, CoreError> {
        Ok(self
            .subjects
            .get(&subject_id)
            .map(|s| s.clone())
            .filter(|s| !s.is_deleted()))
    }

    async fn find_by_identifier(&self, identifier: &str) -> Result<Option<Subject>, CoreError> {
        let mut by_username = None;
        for entry in self.subjects.iter() {
            let subject = entry.value();
            if subject.is_deleted() {
                continue;
            }
            if subject.matches_email(identifier) {
                return Ok(Some(subject.clone()));
            }
            if by_username.is_none() && subject.matches_identifier(identifier) {
                by_username = Some(subject.clone());
            }
        }
        Ok(by_username)
    }

    async fn mark_password_changed(
        &self,
        subject_id: Uuid,
        password_hash: &PasswordHashString,
    ) -> Result<(), CoreError> {
        let mut subject = self
            .subjects
            .get_mut(&subject_id)
            .ok_or_else(|| CoreError::Store(anyhow!("Subject {} not found", subject_id)))?;
        subject.password_hash = password_hash.as_str().to_string();
        subject.password_changed_utc = Some(Utc::now());
        Ok(())
    }

    async fn record_authentication(
        &self,
        subject_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        if let Some(mut subject) = self.subjects.get_mut(&subject_id) {
            subject.last_authenticated_utc = Some(at);
        }
        Ok(())
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert(&self, record: &RefreshCredentialRecord) -> Result<(), CoreError> {
        let mut tables = self.lock_tokens()?;
        if tables.families.contains_key(&record.family_id) {
            return Err(CoreError::Store(anyhow!(
                "Refresh family {} already exists",
                record.family_id
            )));
        }
        tables.push(record.clone())?;
        tables.families.insert(
            record.family_id,
            FamilyEntry {
                subject_id: record.subject_id,
                records: vec![record.record_id],
                revoked_utc: None,
            },
        );
        Ok(())
    }

    async fn find_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshCredentialRecord>, CoreError> {
        let tables = self.lock_tokens()?;
        Ok(tables
            .by_hash
            .get(token_hash)
            .and_then(|id| tables.records.get(id))
            .cloned())
    }

    async fn atomic_transition(
        &self,
        record_id: Uuid,
        expected: RecordState,
        new_state: RecordState,
        successor: Option<&RefreshCredentialRecord>,
    ) -> Result<TransitionOutcome, CoreError> {
        let mut tables = self.lock_tokens()?;

        let Some(record) = tables.records.get(&record_id) else {
            return Ok(TransitionOutcome::NotFound);
        };
        let family_id = record.family_id;
        let current = record.state;

        let family_revoked = tables
            .families
            .get(&family_id)
            .map_or(true, |f| f.revoked_utc.is_some());
        if family_revoked {
            return Ok(TransitionOutcome::FamilyRevoked);
        }
        if current != expected {
            return Ok(TransitionOutcome::StateMismatch(current));
        }
        if let Some(next) = successor {
            if next.family_id != family_id {
                return Err(CoreError::Store(anyhow!(
                    "Successor belongs to family {}, expected {}",
                    next.family_id,
                    family_id
                )));
            }
            tables.push(next.clone())?;
            if let Some(family) = tables.families.get_mut(&family_id) {
                family.records.push(next.record_id);
            }
        }

        let now = Utc::now();
        if let Some(record) = tables.records.get_mut(&record_id) {
            record.state = new_state;
            match new_state {
                RecordState::Consumed => record.consumed_utc = Some(now),
                RecordState::Revoked => record.revoked_utc = Some(now),
                RecordState::Active => {}
            }
            if let Some(next) = successor {
                record.replaced_by = Some(next.record_id);
            }
        }
        Ok(TransitionOutcome::Applied)
    }

    async fn revoke_family(
        &self,
        family_id: FamilyId,
        reason: RevocationReason,
    ) -> Result<u64, CoreError> {
        let mut tables = self.lock_tokens()?;
        Ok(tables.revoke_family(family_id, reason))
    }

    async fn revoke_subject_families(
        &self,
        subject_id: Uuid,
        reason: RevocationReason,
    ) -> Result<Vec<FamilyId>, CoreError> {
        let mut tables = self.lock_tokens()?;
        let live: Vec<FamilyId> = tables
            .families
            .iter()
            .filter(|(_, f)| f.subject_id == subject_id && f.revoked_utc.is_none())
            .map(|(id, _)| *id)
            .collect();
        for family_id in &live {
            tables.revoke_family(*family_id, reason);
        }
        Ok(live)
    }

    async fn family_records(
        &self,
        family_id: FamilyId,
    ) -> Result<Vec<RefreshCredentialRecord>, CoreError> {
        let tables = self.lock_tokens()?;
        let mut records: Vec<RefreshCredentialRecord> = tables
            .families
            .get(&family_id)
            .map(|f| {
                f.records
                    .iter()
                    .filter_map(|id| tables.records.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by_key(|r| r.generation);
        Ok(records)
    }

    async fn active_records_for_subject(
        &self,
        subject_id: Uuid,
    ) -> Result<Vec<RefreshCredentialRecord>, CoreError> {
        let tables = self.lock_tokens()?;
        let mut records: Vec<RefreshCredentialRecord> = tables
            .records
            .values()
            .filter(|r| r.subject_id == subject_id && r.is_active())
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_utc);
        Ok(records)
    }
}

#[async_trait]
impl GrantStore for MemoryStore {
    async fn find_resource(&self, resource_id: Uuid) -> Result<Option<ResourceRecord>, CoreError> {
        Ok(self.resources.get(&resource_id).map(|r| r.clone()))
    }

    async fn find_active_grant(
        &self,
        subject_id: Uuid,
        resource_id: Uuid,
    ) -> Result<Option<ShareGrant>, CoreError> {
        Ok(self
            .grants
            .get(&(subject_id, resource_id))
            .and_then(|history| history.iter().find(|g| g.is_active()).cloned()))
    }

    async fn grant_history(
        &self,
        subject_id: Uuid,
        resource_id: Uuid,
    ) -> Result<Vec<ShareGrant>, CoreError> {
        Ok(self
            .grants
            .get(&(subject_id, resource_id))
            .map(|history| history.clone())
            .unwrap_or_default())
    }
}
