//! Audit sink implementations.
//!
//! Action lifecycle transitions are recorded as [`AuditEvent`]s. The bounded
//! in-memory sink keeps the most recent events for tests and development.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::util::clock::ms_from_datetime;

/// Audit event structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: String,
    /// Related action identifier.
    pub action_id: String,
    /// Action kind name.
    pub kind: String,
    /// Tenant identifier, empty for administrative actions.
    pub tenant: String,
    /// Transition taken (create, trigger, start, stop, finish, retrigger).
    pub transition: String,
    /// Epoch milliseconds from the coordinator clock.
    pub created_at_ms: i64,
    /// Additional context.
    pub detail: Option<String>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send {
    /// Record an audit event.
    fn record(&mut self, event: AuditEvent);
}

/// In-memory audit sink for testing and dev.
pub struct InMemoryAuditSink {
    events: VecDeque<AuditEvent>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_events),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.iter().cloned().collect()
    }

    /// Transitions recorded for one action, oldest first.
    #[must_use]
    pub fn transitions_for(&self, action_id: &str) -> Vec<String> {
        self.events
            .iter()
            .filter(|e| e.action_id == action_id)
            .map(|e| e.transition.clone())
            .collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&mut self, event: AuditEvent) {
        if self.max_events == 0 {
            return;
        }
        if self.events.len() >= self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

/// Helper to build an audit event from context, stamped at `created_at`.
pub fn build_audit_event(
    action_id: impl Into<String>,
    kind: impl Into<String>,
    tenant: impl Into<String>,
    transition: impl Into<String>,
    created_at: DateTime<Utc>,
    detail: Option<String>,
) -> AuditEvent {
    AuditEvent {
        event_id: uuid::Uuid::new_v4().to_string(),
        action_id: action_id.into(),
        kind: kind.into(),
        tenant: tenant.into(),
        transition: transition.into(),
        created_at_ms: ms_from_datetime(created_at),
        detail,
    }
}
