//! Tests for audit sink

use chrono::{DateTime, TimeZone, Utc};
use training_coordinator::core::{build_audit_event, AuditSink, InMemoryAuditSink};

fn at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

#[test]
fn test_in_memory_audit_sink() {
    let mut sink = InMemoryAuditSink::new(10);

    let event = build_audit_event(
        "action1",
        "ZIP_DATASET",
        "tenant1",
        "trigger",
        at(),
        Some("params.json".to_string()),
    );

    sink.record(event);
    assert_eq!(sink.events().len(), 1);

    let events = sink.events();
    assert_eq!(events[0].action_id, "action1");
    assert_eq!(events[0].kind, "ZIP_DATASET");
    assert_eq!(events[0].transition, "trigger");
}

#[test]
fn test_audit_sink_overflow() {
    let mut sink = InMemoryAuditSink::new(2);

    sink.record(build_audit_event("a1", "DELETE_MODEL", "tenant1", "create", at(), None));
    sink.record(build_audit_event("a2", "DELETE_MODEL", "tenant1", "create", at(), None));
    sink.record(build_audit_event("a3", "DELETE_MODEL", "tenant1", "create", at(), None));

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].action_id, "a2"); // First one popped
    assert_eq!(events[1].action_id, "a3");
}

#[test]
fn test_zero_capacity_sink_drops_everything() {
    let mut sink = InMemoryAuditSink::new(0);
    sink.record(build_audit_event("a1", "RESET_TENANTS", "", "create", at(), None));
    assert!(sink.events().is_empty());
}

#[test]
fn test_transitions_for_one_action() {
    let mut sink = InMemoryAuditSink::new(10);
    for transition in ["create", "trigger", "start"] {
        sink.record(build_audit_event("a1", "DELETE_VIDEO", "t", transition, at(), None));
    }
    sink.record(build_audit_event("a2", "DELETE_VIDEO", "t", "create", at(), None));
    sink.record(build_audit_event("a1", "DELETE_VIDEO", "t", "finish", at(), None));

    assert_eq!(sink.transitions_for("a1"), vec!["create", "trigger", "start", "finish"]);
    assert_eq!(sink.transitions_for("a2"), vec!["create"]);
    assert!(sink.transitions_for("missing").is_empty());
}

#[test]
fn test_build_audit_event() {
    let event = build_audit_event(
        "action1",
        "MONITOR_TRAINING",
        "tenant1",
        "finish",
        at(),
        Some("done".to_string()),
    );

    assert_eq!(event.action_id, "action1");
    assert_eq!(event.kind, "MONITOR_TRAINING");
    assert_eq!(event.tenant, "tenant1");
    assert_eq!(event.transition, "finish");
    assert_eq!(event.detail, Some("done".to_string()));
    assert!(!event.event_id.is_empty());
    assert_eq!(event.created_at_ms, at().timestamp_millis());
}
