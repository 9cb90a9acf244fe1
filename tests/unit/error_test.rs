//! Tests for error types

use training_coordinator::core::CoordinatorError;

#[test]
fn test_not_found_error() {
    let err = CoordinatorError::NotFound("model abc".to_string());
    assert_eq!(format!("{}", err), "not found: model abc");
    assert!(!err.is_transient());
}

#[test]
fn test_quota_exceeded_error() {
    let err = CoordinatorError::QuotaExceeded {
        requested: 90,
        remaining: 60,
    };
    assert_eq!(
        format!("{}", err),
        "quota exceeded: requested 90 minutes, only 60 minutes remain"
    );
}

#[test]
fn test_transient_store_error() {
    let err = CoordinatorError::TransientStore("contention".to_string());
    assert!(err.is_transient());
    assert!(!err.is_retrigger());
}

#[test]
fn test_retriggered_error() {
    let err = CoordinatorError::Retriggered {
        action_id: "a1".to_string(),
    };
    assert!(err.is_retrigger());
    assert_eq!(format!("{}", err), "action a1 retriggered");
}

#[test]
fn test_serialization_error_converts() {
    let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
    let err: CoordinatorError = json_err.into();
    assert!(matches!(err, CoordinatorError::Serialization(_)));
}

#[test]
fn test_backend_error() {
    let err = CoordinatorError::Backend("connection failed".to_string());
    assert_eq!(format!("{}", err), "backend error: connection failed");
}
