use service_core::error::AppError;
use thiserror::Error;

use crate::services::policy::PolicyError;

/// Generic rejection text for every authentication and rotation failure.
pub const GENERIC_AUTH_FAILURE: &str = "Invalid credentials";

/// Expected rejection outcomes. These are results, not faults.
///
/// `InvalidCredential`, `Expired`, `AccountInactive` and `ReuseDetected`
/// are distinguished internally only; callers outside the core see
/// [`GENERIC_AUTH_FAILURE`] for all of them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("Invalid credential")]
    InvalidCredential,

    #[error("Credential expired")]
    Expired,

    #[error("Account inactive")]
    AccountInactive,

    #[error("Refresh credential reuse detected")]
    ReuseDetected,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Password policy violation: {0}")]
    PolicyViolation(PolicyError),
}

impl AuthFailure {
    /// Stable code for audit context and diagnostics.
    pub fn code(&self) -> &'static str {
        match self {
            AuthFailure::InvalidCredential => "invalid_credential",
            AuthFailure::Expired => "expired",
            AuthFailure::AccountInactive => "account_inactive",
            AuthFailure::ReuseDetected => "reuse_detected",
            AuthFailure::PermissionDenied => "permission_denied",
            AuthFailure::PolicyViolation(_) => "policy_violation",
        }
    }

    /// Message safe to show to the external caller.
    pub fn public_message(&self) -> String {
        match self {
            AuthFailure::InvalidCredential
            | AuthFailure::Expired
            | AuthFailure::AccountInactive
            | AuthFailure::ReuseDetected => GENERIC_AUTH_FAILURE.to_string(),
            AuthFailure::PermissionDenied => "Permission denied".to_string(),
            AuthFailure::PolicyViolation(e) => e.to_string(),
        }
    }
}

/// Infrastructure faults. These propagate to the surrounding system.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Store error: {0}")]
    Store(anyhow::Error),

    #[error("Signing key error: {0}")]
    SigningKey(String),

    #[error("Token encoding error: {0}")]
    TokenEncoding(#[from] jsonwebtoken::errors::Error),

    #[error("Password hashing error: {0}")]
    Hashing(String),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Store(anyhow::Error::new(err))
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::Store(anyhow::Error::new(err))
    }
}

/// Outer `Err` is a fault; inner `Err` is an expected rejection.
pub type AuthResult<T> = Result<Result<T, AuthFailure>, CoreError>;

impl From<AuthFailure> for AppError {
    fn from(failure: AuthFailure) -> Self {
        match failure {
            AuthFailure::PermissionDenied => {
                AppError::Forbidden(anyhow::anyhow!(failure.public_message()))
            }
            AuthFailure::PolicyViolation(_) => {
                AppError::BadRequest(anyhow::anyhow!(failure.public_message()))
            }
            _ => AppError::Unauthorized(anyhow::anyhow!(GENERIC_AUTH_FAILURE)),
        }
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Store(e) => AppError::DatabaseError(e),
            CoreError::Config(e) => AppError::ConfigError(anyhow::anyhow!(e)),
            other => AppError::InternalError(anyhow::Error::new(other)),
        }
    }
}
