use std::fmt;
use std::sync::Arc;

use argon2::{
    password_hash::{
        rand_core::OsRng, Error as HashError, PasswordHash, PasswordHasher, PasswordVerifier,
        SaltString,
    },
    Algorithm, Argon2, Params, Version,
};
use once_cell::sync::OnceCell;
use secrecy::{ExposeSecret, Secret};

use crate::services::CoreError;

/// Plaintext used only to build the timing-equalisation hash.
const DUMMY_PASSWORD: &str = "dummy-password-for-unknown-identifiers";

/// Newtype for password to prevent accidental logging
#[derive(Debug, Clone)]
pub struct Password(Secret<String>);

impl Password {
    pub fn new(password: String) -> Self {
        Self(Secret::new(password))
    }

    pub fn as_str(&self) -> &str {
        self.0.expose_secret()
    }
}

impl From<&str> for Password {
    fn from(password: &str) -> Self {
        Self::new(password.to_string())
    }
}

/// Newtype for password hash
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordHashString(String);

impl PasswordHashString {
    pub fn new(hash: String) -> Self {
        Self(hash)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Debug for PasswordHashString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PasswordHashString([REDACTED])")
    }
}

/// Argon2id work factor. Parallelism is fixed at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkFactor {
    pub memory_kib: u32,
    pub iterations: u32,
}

impl Default for WorkFactor {
    fn default() -> Self {
        // 64 MiB, 3 passes: well over 100ms per hash on current server CPUs.
        Self {
            memory_kib: 65536,
            iterations: 3,
        }
    }
}

/// Hashes and verifies passwords with Argon2id.
///
/// `hash` and `verify` are CPU-bound; request paths use the `*_blocking`
/// variants, which run on Tokio's blocking pool.
#[derive(Clone)]
pub struct CredentialVerifier {
    params: Params,
    dummy_hash: Arc<OnceCell<PasswordHashString>>,
}

impl CredentialVerifier {
    pub fn new(work: &WorkFactor) -> Result<Self, CoreError> {
        let params = Params::new(work.memory_kib, work.iterations, 1, None)
            .map_err(|e| CoreError::Config(format!("Invalid argon2 parameters: {}", e)))?;

        Ok(Self {
            params,
            dummy_hash: Arc::new(OnceCell::new()),
        })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    /// Hash a password with a fresh random salt. The salt and parameters are
    /// embedded in the PHC string.
    pub fn hash(&self, password: &Password) -> Result<PasswordHashString, CoreError> {
        let salt = SaltString::generate(&mut OsRng);

        let password_hash = self
            .argon2()
            .hash_password(password.as_str().as_bytes(), &salt)
            .map_err(|e| CoreError::Hashing(format!("Failed to hash password: {}", e)))?
            .to_string();

        Ok(PasswordHashString::new(password_hash))
    }

    /// Verify a password against a stored hash.
    ///
    /// The comparison is constant-time. A malformed hash is a verification
    /// failure, logged as an anomaly.
    pub fn verify(&self, password: &Password, password_hash: &PasswordHashString) -> bool {
        let parsed_hash = match PasswordHash::new(password_hash.as_str()) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(error = %e, "Stored credential hash is malformed");
                return false;
            }
        };

        // Parameters come from the stored hash, so older work factors still verify.
        match self
            .argon2()
            .verify_password(password.as_str().as_bytes(), &parsed_hash)
        {
            Ok(()) => true,
            Err(HashError::Password) => false,
            Err(e) => {
                tracing::warn!(error = %e, "Credential hash could not be verified");
                false
            }
        }
    }

    pub async fn hash_blocking(&self, password: Password) -> Result<PasswordHashString, CoreError> {
        let verifier = self.clone();
        tokio::task::spawn_blocking(move || verifier.hash(&password)).await?
    }

    pub async fn verify_blocking(
        &self,
        password: Password,
        password_hash: PasswordHashString,
    ) -> Result<bool, CoreError> {
        let verifier = self.clone();
        Ok(tokio::task::spawn_blocking(move || verifier.verify(&password, &password_hash)).await?)
    }

    /// Spend one verification's worth of work when there is no stored hash,
    /// so unknown identifiers take as long as wrong passwords.
    pub async fn verify_dummy(&self, password: Password) -> Result<(), CoreError> {
        let verifier = self.clone();
        tokio::task::spawn_blocking(move || {
            let dummy = verifier
                .dummy_hash
                .get_or_try_init(|| verifier.hash(&Password::from(DUMMY_PASSWORD)))?;
            verifier.verify(&password, dummy);
            Ok(())
        })
        .await?
    }
}
