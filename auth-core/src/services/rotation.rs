//! Refresh credential rotation with reuse detection.
//!
//! A family is the chain of refresh records descended from one login. At
//! most one record per family is `Active`. Presenting a `Consumed` record
//! means the secret was copied, so the whole family is revoked.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    FamilyId, RecordState, RefreshCredentialRecord, RefreshSecret, RevocationReason,
};
use crate::services::jwt::{AccessCredential, ScopeClaims, TokenIssuer};
use crate::services::store::{SubjectStore, TokenStore, TransitionOutcome};
use crate::services::{AuthFailure, CoreError};

/// A successful rotation: the new pair plus lineage.
#[derive(Debug, Clone)]
pub struct RotatedSession {
    pub subject_id: Uuid,
    pub family_id: FamilyId,
    pub generation: i32,
    pub previous_record_id: Uuid,
    pub access: AccessCredential,
    pub refresh_secret: RefreshSecret,
    pub refresh_expires_utc: DateTime<Utc>,
}

/// Why a presented refresh secret was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationRejection {
    Unknown,
    FamilyRevoked {
        subject_id: Uuid,
        family_id: FamilyId,
    },
    Expired {
        subject_id: Uuid,
        family_id: FamilyId,
    },
    SubjectInactive {
        subject_id: Uuid,
        family_id: FamilyId,
    },
    ReuseDetected {
        subject_id: Uuid,
        family_id: FamilyId,
        revoked_records: u64,
    },
}

impl RotationRejection {
    pub fn failure(&self) -> AuthFailure {
        match self {
            RotationRejection::Unknown | RotationRejection::FamilyRevoked { .. } => {
                AuthFailure::InvalidCredential
            }
            RotationRejection::Expired { .. } => AuthFailure::Expired,
            RotationRejection::SubjectInactive { .. } => AuthFailure::AccountInactive,
            RotationRejection::ReuseDetected { .. } => AuthFailure::ReuseDetected,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RotationRejection::Unknown => "unknown",
            RotationRejection::FamilyRevoked { .. } => "family_revoked",
            RotationRejection::Expired { .. } => "expired",
            RotationRejection::SubjectInactive { .. } => "subject_inactive",
            RotationRejection::ReuseDetected { .. } => "reuse_detected",
        }
    }

    pub fn subject_id(&self) -> Option<Uuid> {
        match self {
            RotationRejection::Unknown => None,
            RotationRejection::FamilyRevoked { subject_id, .. }
            | RotationRejection::Expired { subject_id, .. }
            | RotationRejection::SubjectInactive { subject_id, .. }
            | RotationRejection::ReuseDetected { subject_id, .. } => Some(*subject_id),
        }
    }

    pub fn family_id(&self) -> Option<FamilyId> {
        match self {
            RotationRejection::Unknown => None,
            RotationRejection::FamilyRevoked { family_id, .. }
            | RotationRejection::Expired { family_id, .. }
            | RotationRejection::SubjectInactive { family_id, .. }
            | RotationRejection::ReuseDetected { family_id, .. } => Some(*family_id),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RotationOutcome {
    Rotated(RotatedSession),
    Rejected(RotationRejection),
}

/// A family revoked on request (logout).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevokedFamily {
    pub subject_id: Uuid,
    pub family_id: FamilyId,
    pub revoked_records: u64,
}

#[derive(Clone)]
pub struct RotationStateMachine {
    tokens: Arc<dyn TokenStore>,
    subjects: Arc<dyn SubjectStore>,
    issuer: TokenIssuer,
}

impl RotationStateMachine {
    pub fn new(
        tokens: Arc<dyn TokenStore>,
        subjects: Arc<dyn SubjectStore>,
        issuer: TokenIssuer,
    ) -> Self {
        Self {
            tokens,
            subjects,
            issuer,
        }
    }

    /// Exchange a refresh secret for a new access/refresh pair.
    ///
    /// Of any number of concurrent calls with the same secret, at most one
    /// returns `Rotated`; the others see the record `Consumed` and revoke
    /// the family.
    pub async fn rotate(&self, presented: &RefreshSecret) -> Result<RotationOutcome, CoreError> {
        let Some(record) = self.tokens.find_by_hash(&presented.hash()).await? else {
            return Ok(RotationOutcome::Rejected(RotationRejection::Unknown));
        };
        if !record.matches_secret(presented) {
            return Ok(RotationOutcome::Rejected(RotationRejection::Unknown));
        }

        match record.state {
            RecordState::Revoked => {
                tracing::info!(
                    family_id = %record.family_id,
                    "Refresh attempted on revoked family"
                );
                Ok(RotationOutcome::Rejected(RotationRejection::FamilyRevoked {
                    subject_id: record.subject_id,
                    family_id: record.family_id,
                }))
            }
            _ if record.is_expired() => {
                Ok(RotationOutcome::Rejected(RotationRejection::Expired {
                    subject_id: record.subject_id,
                    family_id: record.family_id,
                }))
            }
            RecordState::Consumed => self.revoke_for_reuse(&record).await,
            RecordState::Active => self.advance(record).await,
        }
    }

    async fn advance(&self, record: RefreshCredentialRecord) -> Result<RotationOutcome, CoreError> {
        let subject = self
            .subjects
            .find_by_id(record.subject_id)
            .await?
            .filter(|s| s.is_usable());
        let Some(subject) = subject else {
            let revoked = self
                .tokens
                .revoke_family(record.family_id, RevocationReason::SubjectRevoked)
                .await?;
            tracing::info!(
                subject_id = %record.subject_id,
                family_id = %record.family_id,
                revoked,
                "Refresh for unusable subject; family revoked"
            );
            return Ok(RotationOutcome::Rejected(RotationRejection::SubjectInactive {
                subject_id: record.subject_id,
                family_id: record.family_id,
            }));
        };

        // Signed before the transition so a signing fault leaves the record Active.
        let access = self.issuer.issue_access_credential(
            subject.subject_id,
            ScopeClaims::for_subject(&subject),
            Some(record.family_id),
        )?;
        let (refresh_secret, successor) = self.issuer.issue_refresh_credential(
            subject.subject_id,
            record.family_id,
            record.generation + 1,
        );

        let outcome = self
            .tokens
            .atomic_transition(
                record.record_id,
                RecordState::Active,
                RecordState::Consumed,
                Some(&successor),
            )
            .await?;

        match outcome {
            TransitionOutcome::Applied => {
                tracing::debug!(
                    family_id = %record.family_id,
                    generation = successor.generation,
                    "Refresh credential rotated"
                );
                Ok(RotationOutcome::Rotated(RotatedSession {
                    subject_id: subject.subject_id,
                    family_id: record.family_id,
                    generation: successor.generation,
                    previous_record_id: record.record_id,
                    access,
                    refresh_secret,
                    refresh_expires_utc: successor.expires_utc,
                }))
            }
            // Lost the race to another presenter of the same secret.
            TransitionOutcome::StateMismatch(RecordState::Consumed) => {
                self.revoke_for_reuse(&record).await
            }
            TransitionOutcome::StateMismatch(_) | TransitionOutcome::FamilyRevoked => {
                Ok(RotationOutcome::Rejected(RotationRejection::FamilyRevoked {
                    subject_id: record.subject_id,
                    family_id: record.family_id,
                }))
            }
            TransitionOutcome::NotFound => {
                Ok(RotationOutcome::Rejected(RotationRejection::Unknown))
            }
        }
    }

    async fn revoke_for_reuse(
        &self,
        record: &RefreshCredentialRecord,
    ) -> Result<RotationOutcome, CoreError> {
        let revoked_records = self
            .tokens
            .revoke_family(record.family_id, RevocationReason::ReuseDetected)
            .await?;

        tracing::error!(
            subject_id = %record.subject_id,
            family_id = %record.family_id,
            generation = record.generation,
            revoked_records,
            "Refresh credential reuse detected; family revoked"
        );

        Ok(RotationOutcome::Rejected(RotationRejection::ReuseDetected {
            subject_id: record.subject_id,
            family_id: record.family_id,
            revoked_records,
        }))
    }

    /// Revoke the family of a presented secret. `None` when the secret is
    /// unknown.
    pub async fn revoke_presented(
        &self,
        presented: &RefreshSecret,
        reason: RevocationReason,
    ) -> Result<Option<RevokedFamily>, CoreError> {
        let record = self
            .tokens
            .find_by_hash(&presented.hash())
            .await?
            .filter(|r| r.matches_secret(presented));
        let Some(record) = record else {
            return Ok(None);
        };

        let revoked_records = self.tokens.revoke_family(record.family_id, reason).await?;
        Ok(Some(RevokedFamily {
            subject_id: record.subject_id,
            family_id: record.family_id,
            revoked_records,
        }))
    }

    /// Revoke every live family of a subject.
    pub async fn revoke_subject(
        &self,
        subject_id: Uuid,
        reason: RevocationReason,
    ) -> Result<Vec<FamilyId>, CoreError> {
        let families = self
            .tokens
            .revoke_subject_families(subject_id, reason)
            .await?;
        tracing::info!(
            subject_id = %subject_id,
            families = families.len(),
            reason = reason.as_str(),
            "Subject refresh families revoked"
        );
        Ok(families)
    }
}
