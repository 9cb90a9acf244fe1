//! Tests for configuration validation

use training_coordinator::config::CoordinatorConfig;

#[test]
fn test_default_config_is_valid() {
    let config = CoordinatorConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.actions.parameters_bucket, "action_parameters");
    assert_eq!(config.actions.retrigger_margin_secs, 60);
    assert_eq!(config.liveness.staleness_threshold_secs, 120);
    assert_eq!(config.training.max_error_message_len, 1500);
}

#[test]
fn test_config_invalid_shared_bucket() {
    let mut invalid = CoordinatorConfig::default();
    invalid.actions.artifacts_bucket = invalid.actions.parameters_bucket.clone();
    assert!(invalid.validate().is_err());
}

#[test]
fn test_config_invalid_margin() {
    let mut invalid = CoordinatorConfig::default();
    invalid.actions.retrigger_margin_secs = invalid.actions.execution_budget_secs;
    assert!(invalid.validate().is_err());
}

#[test]
fn test_config_invalid_transaction_attempts() {
    let mut invalid = CoordinatorConfig::default();
    invalid.actions.transaction_attempts = 0;
    assert!(invalid.validate().is_err());
}

#[test]
fn test_config_invalid_staleness() {
    let mut invalid = CoordinatorConfig::default();
    invalid.liveness.staleness_threshold_secs = 0;
    assert!(invalid.validate().is_err());
}

#[test]
fn test_config_invalid_initial_minutes() {
    let mut invalid = CoordinatorConfig::default();
    invalid.quota.initial_training_minutes = -1;
    assert!(invalid.validate().is_err());
}

#[test]
fn test_config_invalid_archive_retention() {
    let mut invalid = CoordinatorConfig::default();
    invalid.actions.archive_retention_minutes = 0;
    assert!(invalid.validate().is_err());
}

#[test]
fn test_config_invalid_monitor_poll() {
    let mut invalid = CoordinatorConfig::default();
    invalid.training.monitor_poll_secs = 0;
    assert!(invalid.validate().is_err());
}

#[test]
fn test_config_from_json_fills_defaults() {
    let json = r#"{
        "actions": { "execution_budget_secs": 300 },
        "quota": { "initial_training_minutes": 30 }
    }"#;

    let config = CoordinatorConfig::from_json_str(json).expect("valid config");
    assert_eq!(config.actions.execution_budget_secs, 300);
    assert_eq!(config.actions.retrigger_margin_secs, 60);
    assert_eq!(config.quota.initial_training_minutes, 30);
    assert_eq!(config.shards.create_batch_size, 250);
}

#[test]
fn test_config_from_json_rejects_invalid() {
    assert!(CoordinatorConfig::from_json_str("not json").is_err());
    let err = CoordinatorConfig::from_json_str(r#"{ "actions": { "delete_page_size": 0 } }"#)
        .unwrap_err();
    assert!(err.contains("delete_page_size"));
}

#[test]
fn test_duration_helpers() {
    let config = CoordinatorConfig::default();
    assert_eq!(config.actions.execution_budget().num_seconds(), 500);
    assert_eq!(config.liveness.poll_margin().num_seconds(), 5);
    assert_eq!(config.liveness.poll_interval().as_millis(), 100);
    assert_eq!(config.training.monitor_restart().num_seconds(), 180);
    assert_eq!(config.training.monitor_poll().as_secs(), 60);
}

#[test]
fn test_config_from_env_overrides() {
    std::env::set_var("COORDINATOR_DELETE_PAGE_SIZE", "77");
    std::env::set_var("COORDINATOR_ARTIFACTS_BUCKET", "models-and-datasets");
    let config = CoordinatorConfig::from_env().unwrap();
    assert_eq!(config.actions.delete_page_size, 77);
    assert_eq!(config.actions.artifacts_bucket, "models-and-datasets");

    std::env::set_var("COORDINATOR_DELETE_PAGE_SIZE", "many");
    let err = CoordinatorConfig::from_env().unwrap_err();
    assert!(format!("{err:#}").contains("COORDINATOR_DELETE_PAGE_SIZE"));

    std::env::set_var("COORDINATOR_DELETE_PAGE_SIZE", "0");
    assert!(CoordinatorConfig::from_env().is_err());

    std::env::remove_var("COORDINATOR_DELETE_PAGE_SIZE");
    std::env::remove_var("COORDINATOR_ARTIFACTS_BUCKET");

    let every_section = [
        ("COORDINATOR_RETRIGGER_MARGIN_SECS", "30"),
        ("COORDINATOR_SWEEP_MAX_ATTEMPTS", "4"),
        ("COORDINATOR_ARCHIVE_RETENTION_MINUTES", "15"),
        ("COORDINATOR_STALENESS_THRESHOLD_SECS", "45"),
        ("COORDINATOR_POLL_MARGIN_SECS", "2"),
        ("COORDINATOR_POLL_INTERVAL_MS", "250"),
        ("COORDINATOR_MONITOR_RESTART_SECS", "240"),
        ("COORDINATOR_MAX_ERROR_MESSAGE_LEN", "200"),
        ("COORDINATOR_CHECKPOINT_EVERY_N", "50"),
        ("COORDINATOR_CREATE_BATCH_SIZE", "10"),
    ];
    for (var, value) in every_section {
        std::env::set_var(var, value);
    }
    let config = CoordinatorConfig::from_env().unwrap();
    assert_eq!(config.actions.retrigger_margin_secs, 30);
    assert_eq!(config.actions.sweep_max_attempts, 4);
    assert_eq!(config.actions.archive_retention_minutes, 15);
    assert_eq!(config.liveness.staleness_threshold_secs, 45);
    assert_eq!(config.liveness.poll_margin_secs, 2);
    assert_eq!(config.liveness.poll_interval_ms, 250);
    assert_eq!(config.training.monitor_restart_secs, 240);
    assert_eq!(config.training.max_error_message_len, 200);
    assert_eq!(config.training.checkpoint_every_n, 50);
    assert_eq!(config.shards.create_batch_size, 10);
    for (var, _) in every_section {
        std::env::remove_var(var);
    }
}
