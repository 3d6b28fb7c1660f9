//! Audit event model - security events emitted by the core.
//!
//! Persisting and querying events belongs to the audit sink's owner.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Audit event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    LoginSucceeded,
    LoginFailed,
    TokenRefreshed,
    RefreshRejected,
    RefreshReuseDetected,
    SessionLoggedOut,
    PasswordChanged,
    PasswordChangeFailed,
    SessionsRevoked,
    AuthzGranted,
    AuthzAdminOverride,
    AuthzDenied,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::LoginSucceeded => "login_succeeded",
            AuditEventType::LoginFailed => "login_failed",
            AuditEventType::TokenRefreshed => "token_refreshed",
            AuditEventType::RefreshRejected => "refresh_rejected",
            AuditEventType::RefreshReuseDetected => "refresh_reuse_detected",
            AuditEventType::SessionLoggedOut => "session_logged_out",
            AuditEventType::PasswordChanged => "password_changed",
            AuditEventType::PasswordChangeFailed => "password_change_failed",
            AuditEventType::SessionsRevoked => "sessions_revoked",
            AuditEventType::AuthzGranted => "authz_granted",
            AuditEventType::AuthzAdminOverride => "authz_admin_override",
            AuditEventType::AuthzDenied => "authz_denied",
        }
    }

    /// Default severity for downstream alerting.
    pub fn severity(&self) -> Severity {
        match self {
            AuditEventType::RefreshReuseDetected => Severity::Critical,
            AuditEventType::LoginFailed
            | AuditEventType::RefreshRejected
            | AuditEventType::PasswordChangeFailed
            | AuditEventType::AuthzAdminOverride
            | AuditEventType::AuthzDenied => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failure => "failure",
        }
    }
}

/// Audit event entity.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub event_type: AuditEventType,
    pub severity: Severity,
    pub subject_id: Option<Uuid>,
    pub outcome: AuditOutcome,
    pub context: serde_json::Value,
    pub created_utc: DateTime<Utc>,
}

impl AuditEvent {
    /// Create an event with the type's default severity.
    pub fn new(
        event_type: AuditEventType,
        subject_id: Option<Uuid>,
        outcome: AuditOutcome,
        context: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            severity: event_type.severity(),
            subject_id,
            outcome,
            context,
            created_utc: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse_is_critical() {
        let event = AuditEvent::new(
            AuditEventType::RefreshReuseDetected,
            Some(Uuid::new_v4()),
            AuditOutcome::Failure,
            serde_json::json!({ "family_id": Uuid::new_v4() }),
        );
        assert_eq!(event.severity, Severity::Critical);
        assert!(event.severity > AuditEventType::RefreshRejected.severity());
    }

    #[test]
    fn test_admin_override_distinct_from_grant() {
        assert_ne!(
            AuditEventType::AuthzAdminOverride.as_str(),
            AuditEventType::AuthzGranted.as_str()
        );
        assert_eq!(AuditEventType::AuthzAdminOverride.severity(), Severity::Warning);
        assert_eq!(AuditEventType::AuthzGranted.severity(), Severity::Info);
    }

    #[test]
    fn test_serializes_snake_case() {
        let event = AuditEvent::new(
            AuditEventType::SessionLoggedOut,
            None,
            AuditOutcome::Success,
            serde_json::Value::Null,
        );
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["event_type"], "session_logged_out");
        assert_eq!(json["severity"], "info");
        assert_eq!(json["outcome"], "success");
    }
}
