use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    decode, decode_header, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header,
    Validation,
};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::JwtConfig;
use crate::models::{FamilyId, RefreshCredentialRecord, RefreshSecret, Subject};
use crate::services::{AuthFailure, CoreError};

struct KeyEntry {
    encoding: EncodingKey,
    decoding: DecodingKey,
    retired: bool,
}

/// Claims for access credentials (short-lived, self-verifying)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// Subject ID
    pub sub: String,
    /// Issuer
    pub iss: String,
    /// Administrator flag
    #[serde(default)]
    pub adm: bool,
    /// Refresh family the credential was minted for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fam: Option<String>,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// JWT ID
    pub jti: String,
}

/// Authorization scope embedded in an access credential.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopeClaims {
    pub is_admin: bool,
}

impl ScopeClaims {
    pub fn for_subject(subject: &Subject) -> Self {
        Self {
            is_admin: subject.admin_flag,
        }
    }
}

/// A freshly signed access credential.
#[derive(Debug, Clone)]
pub struct AccessCredential {
    pub token: String,
    pub key_id: String,
    pub expires_utc: DateTime<Utc>,
}

/// Result of a successful access credential verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedAccess {
    pub subject_id: Uuid,
    pub is_admin: bool,
    pub family_id: Option<FamilyId>,
    pub key_id: String,
    pub token_id: String,
    pub expires_utc: DateTime<Utc>,
}

/// Mints access credentials (HS256 JWTs carrying a `kid`) and refresh
/// credentials (random secrets whose hash goes into a record).
///
/// Verification never touches a store.
#[derive(Clone)]
pub struct TokenIssuer {
    keys: Arc<HashMap<String, KeyEntry>>,
    active_key_id: String,
    issuer: String,
    access_token_expiry: Duration,
    refresh_token_expiry: Duration,
}

impl TokenIssuer {
    /// Build the key ring from configuration.
    pub fn new(config: &JwtConfig) -> Result<Self, CoreError> {
        let mut keys = HashMap::with_capacity(config.keys.len());
        for key in &config.keys {
            let secret = key.secret.expose_secret().as_bytes();
            let entry = KeyEntry {
                encoding: EncodingKey::from_secret(secret),
                decoding: DecodingKey::from_secret(secret),
                retired: key.retired,
            };
            if keys.insert(key.kid.clone(), entry).is_some() {
                return Err(CoreError::SigningKey(format!(
                    "Duplicate signing key id: {}",
                    key.kid
                )));
            }
        }

        match keys.get(&config.active_key_id) {
            Some(entry) if !entry.retired => {}
            Some(_) => {
                return Err(CoreError::SigningKey(format!(
                    "Active signing key {} is retired",
                    config.active_key_id
                )))
            }
            None => {
                return Err(CoreError::SigningKey(format!(
                    "Active signing key {} is missing",
                    config.active_key_id
                )))
            }
        }

        let access_token_expiry = lifetime(
            "access_token_expiry_minutes",
            Duration::try_minutes(config.access_token_expiry_minutes),
        )?;
        let refresh_token_expiry = lifetime(
            "refresh_token_expiry_days",
            Duration::try_days(config.refresh_token_expiry_days),
        )?;

        tracing::info!(
            active_key_id = %config.active_key_id,
            key_count = keys.len(),
            "Token issuer initialized with HS256 key ring"
        );

        Ok(Self {
            keys: Arc::new(keys),
            active_key_id: config.active_key_id.clone(),
            issuer: config.issuer.clone(),
            access_token_expiry,
            refresh_token_expiry,
        })
    }

    /// Sign an access credential for `subject_id` with the active key.
    pub fn issue_access_credential(
        &self,
        subject_id: Uuid,
        scope: ScopeClaims,
        family_id: Option<FamilyId>,
    ) -> Result<AccessCredential, CoreError> {
        let entry = self.keys.get(&self.active_key_id).ok_or_else(|| {
            CoreError::SigningKey(format!("Active signing key {} is missing", self.active_key_id))
        })?;

        let now = Utc::now();
        let expires_utc = now + self.access_token_expiry;

        let claims = AccessTokenClaims {
            sub: subject_id.to_string(),
            iss: self.issuer.clone(),
            adm: scope.is_admin,
            fam: family_id.map(|f| f.to_string()),
            exp: expires_utc.timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(self.active_key_id.clone());

        let token = encode(&header, &claims, &entry.encoding)?;

        Ok(AccessCredential {
            token,
            key_id: self.active_key_id.clone(),
            expires_utc,
        })
    }

    /// Check signature, key id, issuer and expiry. Fails closed.
    pub fn verify_access_credential(&self, token: &str) -> Result<VerifiedAccess, AuthFailure> {
        let header = decode_header(token).map_err(|_| AuthFailure::InvalidCredential)?;
        if header.alg != Algorithm::HS256 {
            return Err(AuthFailure::InvalidCredential);
        }

        let key_id = header.kid.ok_or(AuthFailure::InvalidCredential)?;
        let entry = self
            .keys
            .get(&key_id)
            .ok_or(AuthFailure::InvalidCredential)?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        let claims = match decode::<AccessTokenClaims>(token, &entry.decoding, &validation) {
            Ok(data) => data.claims,
            Err(e) if matches!(e.kind(), ErrorKind::ExpiredSignature) => {
                return Err(AuthFailure::Expired)
            }
            Err(e) => {
                tracing::debug!(error = %e, "Access credential rejected");
                return Err(AuthFailure::InvalidCredential);
            }
        };

        let subject_id =
            Uuid::parse_str(&claims.sub).map_err(|_| AuthFailure::InvalidCredential)?;
        let family_id = match claims.fam.as_deref() {
            Some(fam) => Some(FamilyId::from_uuid(
                Uuid::parse_str(fam).map_err(|_| AuthFailure::InvalidCredential)?,
            )),
            None => None,
        };
        let expires_utc =
            DateTime::from_timestamp(claims.exp, 0).ok_or(AuthFailure::InvalidCredential)?;

        Ok(VerifiedAccess {
            subject_id,
            is_admin: claims.adm,
            family_id,
            key_id,
            token_id: claims.jti,
            expires_utc,
        })
    }

    /// Generate a refresh secret and the record that stores its hash.
    ///
    /// The raw secret is returned here and nowhere else.
    pub fn issue_refresh_credential(
        &self,
        subject_id: Uuid,
        family_id: FamilyId,
        generation: i32,
    ) -> (RefreshSecret, RefreshCredentialRecord) {
        let secret = RefreshSecret::generate();
        let record = RefreshCredentialRecord::new(
            subject_id,
            family_id,
            generation,
            &secret,
            self.refresh_token_expiry,
        );
        (secret, record)
    }

    pub fn active_key_id(&self) -> &str {
        &self.active_key_id
    }

    /// Get access token expiry in seconds (for client info)
    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.access_token_expiry.num_seconds()
    }
}

/// A credential lifetime must be positive and leave `now + lifetime` representable.
fn lifetime(name: &str, value: Option<Duration>) -> Result<Duration, CoreError> {
    value
        .filter(|d| *d > Duration::zero())
        .filter(|d| Utc::now().checked_add_signed(*d).is_some())
        .ok_or_else(|| CoreError::Config(format!("jwt.{} is out of range", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SigningKeyConfig;
    use secrecy::Secret;

    const OLD_SECRET: &str = "old-signing-secret-0123456789abcdef";
    const NEW_SECRET: &str = "new-signing-secret-0123456789abcdef";

    fn key(kid: &str, secret: &str, retired: bool) -> SigningKeyConfig {
        SigningKeyConfig {
            kid: kid.to_string(),
            secret: Secret::new(secret.to_string()),
            retired,
        }
    }

    fn config(active: &str, keys: Vec<SigningKeyConfig>) -> JwtConfig {
        JwtConfig {
            issuer: "auth-core-test".to_string(),
            active_key_id: active.to_string(),
            keys,
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
        }
    }

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(&config("k1", vec![key("k1", OLD_SECRET, false)])).expect("issuer")
    }

    #[test]
    fn test_access_credential_round_trip() {
        let issuer = issuer();
        let subject_id = Uuid::new_v4();
        let family_id = FamilyId::new();

        let credential = issuer
            .issue_access_credential(subject_id, ScopeClaims { is_admin: true }, Some(family_id))
            .expect("issue");
        assert_eq!(credential.key_id, "k1");
        assert!(credential.expires_utc > Utc::now());

        let verified = issuer
            .verify_access_credential(&credential.token)
            .expect("verify");
        assert_eq!(verified.subject_id, subject_id);
        assert!(verified.is_admin);
        assert_eq!(verified.family_id, Some(family_id));
        assert_eq!(verified.key_id, "k1");
        assert_eq!(issuer.access_token_expiry_seconds(), 900);
    }

    #[test]
    fn test_retired_key_still_verifies_after_rollover() {
        let before = issuer();
        let token = before
            .issue_access_credential(Uuid::new_v4(), ScopeClaims::default(), None)
            .expect("issue")
            .token;

        let after = TokenIssuer::new(&config(
            "k2",
            vec![key("k1", OLD_SECRET, true), key("k2", NEW_SECRET, false)],
        ))
        .expect("issuer");

        assert!(after.verify_access_credential(&token).is_ok());

        let fresh = after
            .issue_access_credential(Uuid::new_v4(), ScopeClaims::default(), None)
            .expect("issue");
        assert_eq!(fresh.key_id, "k2");
        // The old ring has never seen k2.
        assert_eq!(
            before.verify_access_credential(&fresh.token),
            Err(AuthFailure::InvalidCredential)
        );
    }

    #[test]
    fn test_retired_or_missing_active_key_rejected() {
        let retired = TokenIssuer::new(&config("k1", vec![key("k1", OLD_SECRET, true)]));
        assert!(matches!(retired, Err(CoreError::SigningKey(_))));

        let missing = TokenIssuer::new(&config("k9", vec![key("k1", OLD_SECRET, false)]));
        assert!(matches!(missing, Err(CoreError::SigningKey(_))));
    }

    #[test]
    fn test_unrepresentable_lifetimes_rejected() {
        let mut huge_refresh = config("k1", vec![key("k1", OLD_SECRET, false)]);
        huge_refresh.refresh_token_expiry_days = 1_000_000_000;
        assert!(matches!(TokenIssuer::new(&huge_refresh), Err(CoreError::Config(_))));

        let mut overflowing = config("k1", vec![key("k1", OLD_SECRET, false)]);
        overflowing.refresh_token_expiry_days = i64::MAX;
        assert!(matches!(TokenIssuer::new(&overflowing), Err(CoreError::Config(_))));

        let mut zero_access = config("k1", vec![key("k1", OLD_SECRET, false)]);
        zero_access.access_token_expiry_minutes = 0;
        assert!(matches!(TokenIssuer::new(&zero_access), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_expired_credential() {
        let now = Utc::now().timestamp();
        let claims = AccessTokenClaims {
            sub: Uuid::new_v4().to_string(),
            iss: "auth-core-test".to_string(),
            adm: false,
            fam: None,
            exp: now - 60,
            iat: now - 960,
            jti: Uuid::new_v4().to_string(),
        };
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("k1".to_string());
        let token = encode(&header, &claims, &EncodingKey::from_secret(OLD_SECRET.as_bytes()))
            .expect("encode");

        assert_eq!(
            issuer().verify_access_credential(&token),
            Err(AuthFailure::Expired)
        );
    }

    #[test]
    fn test_tampered_and_malformed_rejected() {
        let issuer = issuer();
        let token = issuer
            .issue_access_credential(Uuid::new_v4(), ScopeClaims::default(), None)
            .expect("issue")
            .token;

        let mut parts: Vec<String> = token.split('.').map(str::to_string).collect();
        parts[2] = parts[2].chars().rev().collect();
        let tampered = parts.join(".");

        for bad in [tampered.as_str(), "", "not.a.jwt", "garbage"] {
            assert_eq!(
                issuer.verify_access_credential(bad),
                Err(AuthFailure::InvalidCredential)
            );
        }
    }

    #[test]
    fn test_missing_kid_and_wrong_issuer_rejected() {
        let now = Utc::now().timestamp();
        let mut claims = AccessTokenClaims {
            sub: Uuid::new_v4().to_string(),
            iss: "auth-core-test".to_string(),
            adm: true,
            fam: None,
            exp: now + 600,
            iat: now,
            jti: Uuid::new_v4().to_string(),
        };
        let signing_key = EncodingKey::from_secret(OLD_SECRET.as_bytes());

        let no_kid =
            encode(&Header::new(Algorithm::HS256), &claims, &signing_key).expect("encode");
        assert_eq!(
            issuer().verify_access_credential(&no_kid),
            Err(AuthFailure::InvalidCredential)
        );

        claims.iss = "someone-else".to_string();
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("k1".to_string());
        let foreign = encode(&header, &claims, &signing_key).expect("encode");
        assert_eq!(
            issuer().verify_access_credential(&foreign),
            Err(AuthFailure::InvalidCredential)
        );
    }

    #[test]
    fn test_refresh_credential_stores_only_hash() {
        let issuer = issuer();
        let subject_id = Uuid::new_v4();
        let family_id = FamilyId::new();

        let (secret, record) = issuer.issue_refresh_credential(subject_id, family_id, 3);

        assert_eq!(record.subject_id, subject_id);
        assert_eq!(record.family_id, family_id);
        assert_eq!(record.generation, 3);
        assert!(record.is_active());
        assert_ne!(record.token_hash, secret.expose());
        assert!(record.matches_secret(&secret));
        assert!(record.expires_utc > Utc::now() + Duration::days(6));
    }
}
