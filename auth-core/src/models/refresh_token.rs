//! Refresh credential records - one row per issued refresh token.
//!
//! Every record belongs to a family: the lineage of tokens descended from a
//! single login. At most one record per family is `Active` at any instant.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Raw refresh secret length in bytes before encoding.
const SECRET_BYTES: usize = 32;

/// Identifier shared by every record descended from one login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FamilyId(Uuid);

impl FamilyId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for FamilyId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FamilyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-record state. `Revoked` is applied to every record of a family at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Active,
    Consumed,
    Revoked,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Active => "active",
            RecordState::Consumed => "consumed",
            RecordState::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(RecordState::Active),
            "consumed" => Some(RecordState::Consumed),
            "revoked" => Some(RecordState::Revoked),
            _ => None,
        }
    }
}

/// Why a family was revoked. Kept on the records for forensic audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    Logout,
    PasswordChange,
    ReuseDetected,
    SubjectRevoked,
}

impl RevocationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationReason::Logout => "logout",
            RevocationReason::PasswordChange => "password_change",
            RevocationReason::ReuseDetected => "reuse_detected",
            RevocationReason::SubjectRevoked => "subject_revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "logout" => Some(RevocationReason::Logout),
            "password_change" => Some(RevocationReason::PasswordChange),
            "reuse_detected" => Some(RevocationReason::ReuseDetected),
            "subject_revoked" => Some(RevocationReason::SubjectRevoked),
            _ => None,
        }
    }
}

/// The raw refresh secret handed to the client exactly once.
///
/// Debug output is redacted; only its SHA-256 hash is ever stored.
#[derive(Debug, Clone)]
pub struct RefreshSecret(Secret<String>);

impl RefreshSecret {
    /// Generate a fresh secret from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SECRET_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(Secret::new(URL_SAFE_NO_PAD.encode(bytes)))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn hash(&self) -> String {
        RefreshCredentialRecord::hash_secret(self.expose())
    }
}

impl From<String> for RefreshSecret {
    fn from(raw: String) -> Self {
        Self(Secret::new(raw))
    }
}

impl From<&str> for RefreshSecret {
    fn from(raw: &str) -> Self {
        Self(Secret::new(raw.to_string()))
    }
}

/// One issued refresh token.
#[derive(Debug, Clone)]
pub struct RefreshCredentialRecord {
    pub record_id: Uuid,
    pub subject_id: Uuid,
    pub family_id: FamilyId,
    /// 0 for the login record, +1 per rotation.
    pub generation: i32,
    /// SHA-256 hex of the raw secret.
    pub token_hash: String,
    pub state: RecordState,
    pub replaced_by: Option<Uuid>,
    pub revocation_reason: Option<RevocationReason>,
    pub expires_utc: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
    pub consumed_utc: Option<DateTime<Utc>>,
    pub revoked_utc: Option<DateTime<Utc>>,
}

impl RefreshCredentialRecord {
    /// Create an `Active` record for `secret`, expiring `lifetime` from now.
    ///
    /// A lifetime past the end of the calendar saturates at the latest
    /// representable instant.
    pub fn new(
        subject_id: Uuid,
        family_id: FamilyId,
        generation: i32,
        secret: &RefreshSecret,
        lifetime: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            record_id: Uuid::new_v4(),
            subject_id,
            family_id,
            generation,
            token_hash: secret.hash(),
            state: RecordState::Active,
            replaced_by: None,
            revocation_reason: None,
            expires_utc: now.checked_add_signed(lifetime).unwrap_or(DateTime::<Utc>::MAX_UTC),
            created_utc: now,
            consumed_utc: None,
            revoked_utc: None,
        }
    }

    /// Hash a raw secret using SHA-256
    pub fn hash_secret(secret: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Constant-time check that `secret` is the one this record was issued for.
    pub fn matches_secret(&self, secret: &RefreshSecret) -> bool {
        let presented = secret.hash();
        presented.as_bytes().ct_eq(self.token_hash.as_bytes()).into()
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_utc
    }

    pub fn is_active(&self) -> bool {
        self.state == RecordState::Active
    }
}
