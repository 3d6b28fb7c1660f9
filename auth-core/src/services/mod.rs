//! Services layer for auth-core.
//!
//! Credential verification lives in `utils`; everything that issues,
//! rotates, revokes or authorizes lives here.

pub mod database;
pub mod error;
mod jwt;
pub mod memory;
mod permission;
pub mod policy;
mod rotation;
pub mod security_audit;
mod session;
pub mod store;

pub use database::Database;
pub use error::{AuthFailure, AuthResult, CoreError, GENERIC_AUTH_FAILURE};
pub use jwt::{AccessCredential, AccessTokenClaims, ScopeClaims, TokenIssuer, VerifiedAccess};
pub use memory::MemoryStore;
pub use permission::{AccessDecision, PermissionEngine};
pub use policy::{PasswordPolicy, PolicyError};
pub use rotation::{
    RevokedFamily, RotatedSession, RotationOutcome, RotationRejection, RotationStateMachine,
};
pub use security_audit::{AuditSink, ChannelAuditSink, MemoryAuditSink, TracingAuditSink};
pub use session::{SessionFacade, SessionInfo, SessionTokens, TOKEN_TYPE_BEARER};
pub use store::{GrantStore, SubjectStore, TokenStore, TransitionOutcome};
