//! Training-minute ledger: admission, release, settlement, and daily counters.

mod common;

use std::sync::Arc;

use chrono::Duration;
use common::Harness;
use training_coordinator::core::quota::compute_refund;
use training_coordinator::core::{CoordinatorError, QuotaLedger, Settlement, TenantRecord};
use training_coordinator::infra::scheduler::ExternalJobState;
use training_coordinator::infra::store::{run_transaction, EntityKind};
use training_coordinator::util::Clock;

#[test]
fn test_new_tenant_gets_initial_balance() {
    let h = Harness::new();
    let tenant = h.tenant("acme");
    assert_eq!(h.coordinator.ledger.remaining_minutes(&tenant).unwrap(), 120);
    assert_eq!(h.tenant("acme"), tenant);
    assert_eq!(h.store.count(EntityKind::Tenant), 1);
    assert!(matches!(
        h.coordinator.ledger.ensure_tenant("  "),
        Err(CoordinatorError::BadInput(_))
    ));
}

#[test]
fn test_reserve_rejects_overdraft_without_change() {
    let h = Harness::new();
    let tenant = h.tenant("acme");
    let ledger = &h.coordinator.ledger;

    assert_eq!(ledger.reserve(&tenant, 100).unwrap(), 20);
    let err = ledger.reserve(&tenant, 21).unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::QuotaExceeded {
            requested: 21,
            remaining: 20
        }
    ));
    assert_eq!(ledger.remaining_minutes(&tenant).unwrap(), 20);
    assert_eq!(ledger.reserve(&tenant, 20).unwrap(), 0);
}

#[test]
fn test_reserve_and_release_validate_amounts() {
    let h = Harness::new();
    let tenant = h.tenant("acme");
    let ledger = &h.coordinator.ledger;
    assert!(matches!(ledger.reserve(&tenant, 0), Err(CoordinatorError::BadInput(_))));
    assert!(matches!(ledger.release(&tenant, -5), Err(CoordinatorError::BadInput(_))));
    assert_eq!(ledger.release(&tenant, 15).unwrap(), 135);
}

#[test]
fn test_unknown_tenant_is_not_found() {
    let h = Harness::new();
    let ghost = training_coordinator::util::TenantId::generate();
    assert!(matches!(
        h.coordinator.ledger.reserve(&ghost, 10),
        Err(CoordinatorError::NotFound(_))
    ));
}

#[test]
fn test_concurrent_reservations_never_overdraw() {
    let h = Harness::new();
    let tenant = h.tenant("acme");
    let ledger: Arc<QuotaLedger> = h.coordinator.ledger.clone();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ledger = ledger.clone();
            let tenant = tenant.clone();
            std::thread::spawn(move || ledger.reserve(&tenant, 25).is_ok())
        })
        .collect();
    let granted = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();

    assert_eq!(granted, 4);
    assert_eq!(ledger.remaining_minutes(&tenant).unwrap(), 20);
}

#[test]
fn test_transient_contention_is_retried() {
    let h = Harness::new();
    let tenant = h.tenant("acme");
    h.store.fail_next_transactions(2);
    assert_eq!(h.coordinator.ledger.reserve(&tenant, 10).unwrap(), 110);

    h.store.fail_next_transactions(3);
    assert!(matches!(
        h.coordinator.ledger.reserve(&tenant, 10),
        Err(CoordinatorError::TransientStore(_))
    ));
    assert_eq!(h.coordinator.ledger.remaining_minutes(&tenant).unwrap(), 110);
}

#[test]
fn test_settlement_applies_once() {
    let h = Harness::new();
    let tenant = h.tenant("acme");
    h.coordinator.ledger.reserve(&tenant, 60).unwrap();
    let now = h.clock.now();
    let mut settlement = Settlement::default();

    let first = run_transaction(h.store.as_ref(), 1, |txn| {
        QuotaLedger::settle_in(txn, &tenant, &mut settlement, 60, 20 * 60, ExternalJobState::Succeeded, now)
    })
    .unwrap();
    assert_eq!(first, Some(40));
    assert!(settlement.is_settled());

    let second = run_transaction(h.store.as_ref(), 1, |txn| {
        QuotaLedger::settle_in(txn, &tenant, &mut settlement, 60, 20 * 60, ExternalJobState::Succeeded, now)
    })
    .unwrap();
    assert_eq!(second, None);
    assert_eq!(h.coordinator.ledger.remaining_minutes(&tenant).unwrap(), 100);
}

#[test]
fn test_refund_rules() {
    assert_eq!(compute_refund(30, 0, ExternalJobState::Cancelled), 30);
    assert_eq!(compute_refund(30, 61, ExternalJobState::Succeeded), 28);
    assert_eq!(compute_refund(30, 45 * 60, ExternalJobState::Succeeded), 0);
    assert_eq!(compute_refund(30, 45 * 60, ExternalJobState::Failed), 30);
}

#[test]
fn test_daily_counters_reset_on_new_day() {
    let h = Harness::new();
    let tenant = h.tenant("acme");
    let ledger = &h.coordinator.ledger;

    ledger.record_video_uploaded(&tenant).unwrap();
    ledger.record_video_uploaded(&tenant).unwrap();
    let counters = ledger.record_dataset_downloaded(&tenant).unwrap();
    assert_eq!(counters.videos_uploaded, 2);
    assert_eq!(counters.datasets_downloaded, 1);

    h.clock.advance(Duration::hours(20));
    let record: TenantRecord = ledger.tenant(&tenant).unwrap();
    assert_eq!(record.daily.videos_uploaded, 0);
    assert_eq!(record.daily.datasets_downloaded, 0);
    assert_eq!(record.remaining_training_minutes, 120);
}
