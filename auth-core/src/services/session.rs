//! Session lifecycle: login, refresh, logout, password change.
//!
//! Every expected failure comes back as the inner `Err` of an
//! [`AuthResult`]; the outer `Err` is reserved for store, signing and
//! hashing faults.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::{
    AuditEvent, AuditEventType, AuditOutcome, FamilyId, RefreshSecret, RevocationReason,
};
use crate::services::jwt::{AccessCredential, ScopeClaims, TokenIssuer, VerifiedAccess};
use crate::services::policy::{PasswordPolicy, PolicyError};
use crate::services::rotation::{RotationOutcome, RotationRejection, RotationStateMachine};
use crate::services::security_audit::AuditSink;
use crate::services::store::{SubjectStore, TokenStore};
use crate::services::{AuthFailure, AuthResult, CoreError};
use crate::utils::{CredentialVerifier, Password, PasswordHashString};

pub const TOKEN_TYPE_BEARER: &str = "Bearer";

/// Credentials handed to the client after login or refresh.
#[derive(Debug, Clone)]
pub struct SessionTokens {
    pub subject_id: Uuid,
    pub family_id: FamilyId,
    pub access_token: String,
    pub access_expires_utc: DateTime<Utc>,
    pub token_type: &'static str,
    /// Seconds until the access token expires
    pub expires_in: i64,
    pub refresh_token: RefreshSecret,
    pub refresh_expires_utc: DateTime<Utc>,
}

impl SessionTokens {
    fn new(
        subject_id: Uuid,
        family_id: FamilyId,
        access: AccessCredential,
        expires_in: i64,
        refresh_token: RefreshSecret,
        refresh_expires_utc: DateTime<Utc>,
    ) -> Self {
        Self {
            subject_id,
            family_id,
            access_token: access.token,
            access_expires_utc: access.expires_utc,
            token_type: TOKEN_TYPE_BEARER,
            expires_in,
            refresh_token,
            refresh_expires_utc,
        }
    }
}

/// One live login as seen from the account's session list.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionInfo {
    pub family_id: FamilyId,
    pub generation: i32,
    pub last_rotated_utc: DateTime<Utc>,
    pub expires_utc: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SessionFacade {
    subjects: Arc<dyn SubjectStore>,
    tokens: Arc<dyn TokenStore>,
    verifier: CredentialVerifier,
    issuer: TokenIssuer,
    rotation: RotationStateMachine,
    policy: PasswordPolicy,
    audit: Arc<dyn AuditSink>,
}

impl SessionFacade {
    pub fn new(
        subjects: Arc<dyn SubjectStore>,
        tokens: Arc<dyn TokenStore>,
        verifier: CredentialVerifier,
        issuer: TokenIssuer,
        policy: PasswordPolicy,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let rotation = RotationStateMachine::new(tokens.clone(), subjects.clone(), issuer.clone());
        Self {
            subjects,
            tokens,
            verifier,
            issuer,
            rotation,
            policy,
            audit,
        }
    }

    /// Verify a password and open a new refresh family.
    pub async fn login(&self, identifier: &str, password: Password) -> AuthResult<SessionTokens> {
        let Some(subject) = self.subjects.find_by_identifier(identifier).await? else {
            self.verifier.verify_dummy(password).await?;
            return Ok(Err(self.reject_login(
                None,
                AuthFailure::InvalidCredential,
                "unknown_identifier",
            )));
        };

        let stored_hash = PasswordHashString::new(subject.password_hash.clone());
        if !self.verifier.verify_blocking(password, stored_hash).await? {
            return Ok(Err(self.reject_login(
                Some(subject.subject_id),
                AuthFailure::InvalidCredential,
                "wrong_password",
            )));
        }

        if !subject.is_usable() {
            return Ok(Err(self.reject_login(
                Some(subject.subject_id),
                AuthFailure::AccountInactive,
                "account_inactive",
            )));
        }

        let family_id = FamilyId::new();
        let access = self.issuer.issue_access_credential(
            subject.subject_id,
            ScopeClaims::for_subject(&subject),
            Some(family_id),
        )?;
        let (refresh_token, record) =
            self.issuer
                .issue_refresh_credential(subject.subject_id, family_id, 0);
        self.tokens.insert(&record).await?;
        self.subjects
            .record_authentication(subject.subject_id, Utc::now())
            .await?;

        tracing::info!(
            subject_id = %subject.subject_id,
            family_id = %family_id,
            key_id = %access.key_id,
            "Login succeeded"
        );
        self.emit(
            AuditEventType::LoginSucceeded,
            Some(subject.subject_id),
            AuditOutcome::Success,
            serde_json::json!({ "family_id": family_id }),
        );

        Ok(Ok(SessionTokens::new(
            subject.subject_id,
            family_id,
            access,
            self.issuer.access_token_expiry_seconds(),
            refresh_token,
            record.expires_utc,
        )))
    }

    /// Rotate a refresh secret.
    pub async fn refresh(&self, presented: &RefreshSecret) -> AuthResult<SessionTokens> {
        match self.rotation.rotate(presented).await? {
            RotationOutcome::Rotated(session) => {
                self.emit(
                    AuditEventType::TokenRefreshed,
                    Some(session.subject_id),
                    AuditOutcome::Success,
                    serde_json::json!({
                        "family_id": session.family_id,
                        "generation": session.generation,
                        "previous_record_id": session.previous_record_id,
                    }),
                );
                Ok(Ok(SessionTokens::new(
                    session.subject_id,
                    session.family_id,
                    session.access,
                    self.issuer.access_token_expiry_seconds(),
                    session.refresh_secret,
                    session.refresh_expires_utc,
                )))
            }
            RotationOutcome::Rejected(rejection) => {
                let (event_type, context) = match &rejection {
                    RotationRejection::ReuseDetected {
                        family_id,
                        revoked_records,
                        ..
                    } => (
                        AuditEventType::RefreshReuseDetected,
                        serde_json::json!({
                            "family_id": family_id,
                            "revoked_records": revoked_records,
                        }),
                    ),
                    other => (
                        AuditEventType::RefreshRejected,
                        serde_json::json!({
                            "family_id": other.family_id(),
                            "reason": other.code(),
                        }),
                    ),
                };
                self.emit(
                    event_type,
                    rejection.subject_id(),
                    AuditOutcome::Failure,
                    context,
                );
                Ok(Err(rejection.failure()))
            }
        }
    }

    /// Revoke the family of a refresh secret. Unknown or already revoked
    /// secrets succeed silently.
    pub async fn logout(&self, presented: &RefreshSecret) -> Result<(), CoreError> {
        let Some(revoked) = self
            .rotation
            .revoke_presented(presented, RevocationReason::Logout)
            .await?
        else {
            tracing::debug!("Logout with unknown refresh credential");
            return Ok(());
        };

        tracing::info!(
            subject_id = %revoked.subject_id,
            family_id = %revoked.family_id,
            "Logout"
        );
        self.emit(
            AuditEventType::SessionLoggedOut,
            Some(revoked.subject_id),
            AuditOutcome::Success,
            serde_json::json!({
                "family_id": revoked.family_id,
                "revoked_records": revoked.revoked_records,
            }),
        );
        Ok(())
    }

    /// Verify the current password, store a new one and end every session.
    pub async fn change_password(
        &self,
        subject_id: Uuid,
        current: Password,
        new_password: Password,
    ) -> AuthResult<()> {
        let Some(subject) = self.subjects.find_by_id(subject_id).await? else {
            self.verifier.verify_dummy(current).await?;
            return Ok(Err(self.reject_password_change(
                subject_id,
                AuthFailure::InvalidCredential,
            )));
        };

        let stored_hash = PasswordHashString::new(subject.password_hash.clone());
        if !self
            .verifier
            .verify_blocking(current.clone(), stored_hash)
            .await?
        {
            return Ok(Err(self.reject_password_change(
                subject_id,
                AuthFailure::InvalidCredential,
            )));
        }
        if !subject.is_usable() {
            return Ok(Err(
                self.reject_password_change(subject_id, AuthFailure::AccountInactive)
            ));
        }
        if current.as_str() == new_password.as_str() {
            return Ok(Err(self.reject_password_change(
                subject_id,
                AuthFailure::PolicyViolation(PolicyError::PasswordUnchanged),
            )));
        }
        if let Err(violation) = self.policy.validate(new_password.as_str()) {
            return Ok(Err(self.reject_password_change(
                subject_id,
                AuthFailure::PolicyViolation(violation),
            )));
        }

        let new_hash = self.verifier.hash_blocking(new_password).await?;

        // Families are revoked before the hash is replaced, and swept again
        // after it for logins that verified the old hash in between.
        let mut revoked = self
            .rotation
            .revoke_subject(subject_id, RevocationReason::PasswordChange)
            .await?;
        self.subjects
            .mark_password_changed(subject_id, &new_hash)
            .await?;
        revoked.extend(
            self.rotation
                .revoke_subject(subject_id, RevocationReason::PasswordChange)
                .await?,
        );

        tracing::info!(
            subject_id = %subject_id,
            revoked_families = revoked.len(),
            "Password changed"
        );
        self.emit(
            AuditEventType::PasswordChanged,
            Some(subject_id),
            AuditOutcome::Success,
            serde_json::json!({ "revoked_families": revoked.len() }),
        );
        Ok(Ok(()))
    }

    /// Check an access credential. No store access.
    pub fn authenticate(&self, access_token: &str) -> Result<VerifiedAccess, AuthFailure> {
        self.issuer.verify_access_credential(access_token)
    }

    /// Revoke every refresh family of a subject (account disabled, forced
    /// sign-out). Returns the number of families revoked.
    pub async fn revoke_all_sessions(&self, subject_id: Uuid) -> Result<usize, CoreError> {
        let revoked = self
            .rotation
            .revoke_subject(subject_id, RevocationReason::SubjectRevoked)
            .await?;
        self.emit(
            AuditEventType::SessionsRevoked,
            Some(subject_id),
            AuditOutcome::Success,
            serde_json::json!({ "revoked_families": revoked.len() }),
        );
        Ok(revoked.len())
    }

    /// Live, unexpired refresh families of a subject.
    pub async fn list_sessions(&self, subject_id: Uuid) -> Result<Vec<SessionInfo>, CoreError> {
        let records = self.tokens.active_records_for_subject(subject_id).await?;
        Ok(records
            .into_iter()
            .filter(|r| !r.is_expired())
            .map(|r| SessionInfo {
                family_id: r.family_id,
                generation: r.generation,
                last_rotated_utc: r.created_utc,
                expires_utc: r.expires_utc,
            })
            .collect())
    }

    fn reject_login(
        &self,
        subject_id: Option<Uuid>,
        failure: AuthFailure,
        reason: &str,
    ) -> AuthFailure {
        tracing::warn!(subject_id = ?subject_id, reason, "Login rejected");
        self.emit(
            AuditEventType::LoginFailed,
            subject_id,
            AuditOutcome::Failure,
            serde_json::json!({ "reason": reason }),
        );
        failure
    }

    fn reject_password_change(&self, subject_id: Uuid, failure: AuthFailure) -> AuthFailure {
        tracing::warn!(subject_id = %subject_id, reason = failure.code(), "Password change rejected");
        self.emit(
            AuditEventType::PasswordChangeFailed,
            Some(subject_id),
            AuditOutcome::Failure,
            serde_json::json!({ "reason": failure.code() }),
        );
        failure
    }

    fn emit(
        &self,
        event_type: AuditEventType,
        subject_id: Option<Uuid>,
        outcome: AuditOutcome,
        context: serde_json::Value,
    ) {
        self.audit
            .emit(AuditEvent::new(event_type, subject_id, outcome, context));
    }
}
