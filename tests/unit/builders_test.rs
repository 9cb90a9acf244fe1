//! Tests for builder modules

use std::sync::Arc;

use chrono::Utc;
use training_coordinator::builders::{build_coordinator, Collaborators};
use training_coordinator::config::CoordinatorConfig;
use training_coordinator::core::{ActionKind, CoordinatorError};
use training_coordinator::infra::{InMemoryBlobStore, InMemoryJobScheduler, InMemoryStore};
use training_coordinator::util::ManualClock;

fn collaborators() -> Collaborators {
    Collaborators {
        store: Arc::new(InMemoryStore::new()),
        blobs: Arc::new(InMemoryBlobStore::new()),
        scheduler: Arc::new(InMemoryJobScheduler::new()),
        clock: Arc::new(ManualClock::new(Utc::now())),
    }
}

#[test]
fn test_builder_registers_every_kind() {
    let coordinator = build_coordinator(CoordinatorConfig::default(), collaborators(), None)
        .expect("coordinator");
    for kind in ActionKind::ALL {
        assert!(coordinator.dispatcher.handles(kind), "{kind} has no handler");
    }
}

#[test]
fn test_builder_rejects_invalid_config() {
    let mut config = CoordinatorConfig::default();
    config.actions.execution_budget_secs = 0;
    let result = build_coordinator(config, collaborators(), None);
    match result {
        Err(CoordinatorError::BadInput(message)) => assert!(message.starts_with("config invalid")),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("invalid config accepted"),
    }
}

#[test]
fn test_builder_shares_config() {
    let mut config = CoordinatorConfig::default();
    config.quota.initial_training_minutes = 45;
    let coordinator = build_coordinator(config, collaborators(), None).expect("coordinator");
    assert_eq!(coordinator.ledger.initial_minutes(), 45);
    let tenant = coordinator.ledger.ensure_tenant("acme").unwrap();
    assert_eq!(coordinator.ledger.remaining_minutes(&tenant).unwrap(), 45);
}
