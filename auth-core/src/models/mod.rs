pub mod audit_event;
pub mod refresh_token;
pub mod share_grant;
pub mod subject;

pub use audit_event::{AuditEvent, AuditEventType, AuditOutcome, Severity};
pub use refresh_token::{
    FamilyId, RecordState, RefreshCredentialRecord, RefreshSecret, RevocationReason,
};
pub use share_grant::{PermissionLevel, ResourceRecord, ShareGrant};
pub use subject::Subject;
