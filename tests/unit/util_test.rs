//! Tests for utility functions

use chrono::{Duration, TimeZone, Utc};
use training_coordinator::util::{
    datetime_from_ms, ms_from_datetime, parse_id_list, single_line, Clock, DatasetId, ManualClock,
    ModelId, TenantId,
};

#[test]
fn test_id_generation_is_hex() {
    let id = TenantId::generate();
    assert_eq!(id.as_str().len(), 32);
    assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(id, TenantId::generate());
}

#[test]
fn test_id_parse_normalizes_case() {
    let upper = "0123456789ABCDEF0123456789ABCDEF";
    let id = ModelId::parse(upper).expect("valid id");
    assert_eq!(id.as_str(), upper.to_ascii_lowercase());
}

#[test]
fn test_id_serializes_transparently() {
    let id = DatasetId::generate();
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, format!("\"{id}\""));
}

#[test]
fn test_parse_id_list_rejects_bad_element() {
    let good = DatasetId::generate();
    let json = format!("[\"{good}\", \"bad\"]");
    assert!(parse_id_list(&json, DatasetId::parse).is_err());
}

#[test]
fn test_manual_clock() {
    let start = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
    let clock = ManualClock::new(start);
    assert_eq!(clock.now(), start);
    clock.advance(Duration::seconds(90));
    assert_eq!(clock.now(), start + Duration::seconds(90));
    clock.set(start);
    assert_eq!(clock.now(), start);
}

#[test]
fn test_millisecond_conversions() {
    let at = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
    assert_eq!(datetime_from_ms(ms_from_datetime(at)), at);
}

#[test]
fn test_single_line() {
    assert_eq!(single_line("a\nb"), "a ... b");
    assert_eq!(single_line("plain"), "plain");
}
