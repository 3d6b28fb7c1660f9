//! Security audit sinks.
//!
//! The core only hands events to an [`AuditSink`]; storage, retention and
//! querying belong to whoever owns the sink.

use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::models::{AuditEvent, AuditEventType, Severity};

/// Receiver of audit events. `emit` must not block the caller.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

/// Writes every event as a structured log line on the `audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        let subject_id = event.subject_id.map(|id| id.to_string());
        match event.severity {
            Severity::Info => tracing::info!(
                target: "audit",
                event_id = %event.event_id,
                event_type = event.event_type.as_str(),
                outcome = event.outcome.as_str(),
                subject_id = ?subject_id,
                context = %event.context,
                "Security event"
            ),
            Severity::Warning => tracing::warn!(
                target: "audit",
                event_id = %event.event_id,
                event_type = event.event_type.as_str(),
                outcome = event.outcome.as_str(),
                subject_id = ?subject_id,
                context = %event.context,
                "Security event"
            ),
            Severity::Critical => tracing::error!(
                target: "audit",
                event_id = %event.event_id,
                event_type = event.event_type.as_str(),
                outcome = event.outcome.as_str(),
                subject_id = ?subject_id,
                context = %event.context,
                "Security event"
            ),
        }
    }
}

/// Hands events to a bounded channel for a background writer.
///
/// When the channel is full or closed the event is dropped and logged.
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    tx: mpsc::Sender<AuditEvent>,
}

impl ChannelAuditSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl AuditSink for ChannelAuditSink {
    fn emit(&self, event: AuditEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let (reason, event) = match e {
                mpsc::error::TrySendError::Full(event) => ("full", event),
                mpsc::error::TrySendError::Closed(event) => ("closed", event),
            };
            tracing::error!(
                event_id = %event.event_id,
                event_type = event.event_type.as_str(),
                severity = event.severity.as_str(),
                reason,
                "Failed to queue security audit event"
            );
        }
    }
}

/// Keeps events in memory. Used by tests and local tooling.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn events_of(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, event: AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
