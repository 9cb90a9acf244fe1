//! Administrative sweeps over every tenant.

mod common;

use chrono::Duration;
use common::{bird_plans, count_finished, Harness};
use serde_json::json;
use training_coordinator::core::sweep::SweepState;
use training_coordinator::core::{ActionKind, ActionRecord, ActionState, CoordinatorError, StartTrainingRequest};
use training_coordinator::infra::store::EntityKind;
use training_coordinator::runtime::DispatchOutcome;
use training_coordinator::util::{Clock, TenantId};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn balances(h: &Harness, tenants: &[&TenantId]) -> Vec<i64> {
    tenants
        .iter()
        .map(|t| h.coordinator.ledger.remaining_minutes(t).unwrap())
        .collect()
}

/// The single retained record of `kind`.
fn admin_record(h: &Harness, kind: ActionKind) -> ActionRecord {
    let mut records = h.coordinator.actions.list_actions(None, Some(kind)).unwrap();
    assert_eq!(records.len(), 1);
    records.remove(0)
}

fn final_state(record: &ActionRecord) -> SweepState {
    SweepState::from_params(record.params.as_ref().expect("params kept")).unwrap()
}

/// Start one training run per description on a fresh dataset, then drop the
/// queued monitor events so only the sweep under test runs.
async fn start_models(h: &Harness, tenant: &TenantId, descriptions: &[&str]) {
    let video = h.labeled_video(tenant, 10, 4);
    let dataset = h
        .completed_dataset(tenant, "birds", &["bird", "cat"], bird_plans(&video))
        .await;
    for description in descriptions {
        h.coordinator
            .training
            .start_training(
                tenant,
                StartTrainingRequest {
                    description: (*description).to_string(),
                    dataset_ids: vec![dataset.clone()],
                    starting_model: "SSD MobileNet v2 320x320".into(),
                    max_running_minutes: 10,
                    num_training_steps: 1000,
                    use_accelerator: false,
                },
            )
            .await
            .unwrap();
    }
    while h.events.try_recv().is_ok() {}
}

// ============================================================================
// TESTS
// ============================================================================

#[tokio::test]
async fn test_reset_sets_every_balance() {
    let h = Harness::new();
    let acme = h.tenant("acme");
    let globex = h.tenant("globex");
    h.coordinator.ledger.reserve(&acme, 100).unwrap();

    h.coordinator.sweeps.reset_remaining_training_minutes(50).unwrap();
    let outcomes = h.drain().await;
    assert_eq!(count_finished(&outcomes), 1);
    assert_eq!(balances(&h, &[&acme, &globex]), vec![50, 50]);

    let record = admin_record(&h, ActionKind::ResetRemainingTrainingMinutes);
    assert_eq!(record.state, ActionState::Finished);
    assert!(record.tenant_id.is_none());
    let state = final_state(&record);
    assert_eq!(state.num_processed, 2);
    assert_eq!(state.processed, vec!["acme".to_string(), "globex".to_string()]);
    assert!(state.failure_counts.is_empty());
    assert_eq!(h.store.count(EntityKind::AdminAction), 1);
}

#[tokio::test]
async fn test_increment_adds_to_every_balance() {
    let h = Harness::new();
    let acme = h.tenant("acme");
    let globex = h.tenant("globex");
    h.coordinator.ledger.reserve(&globex, 20).unwrap();

    h.coordinator.sweeps.increment_remaining_training_minutes(15).unwrap();
    h.drain().await;
    assert_eq!(balances(&h, &[&acme, &globex]), vec![135, 115]);
}

#[tokio::test]
async fn test_reset_tenants_restores_initial_state() {
    let h = Harness::new();
    let acme = h.tenant("acme");
    let video = h.labeled_video(&acme, 10, 1);
    h.coordinator.ledger.reserve(&acme, 60).unwrap();
    h.coordinator.ledger.record_video_uploaded(&acme).unwrap();
    h.coordinator.videos.delete_video(&acme, &video).unwrap();
    h.drain().await;
    assert!(!h.coordinator.ledger.tenant(&acme).unwrap().videos_deleted.is_empty());

    h.coordinator.sweeps.reset_tenants().unwrap();
    h.drain().await;
    let tenant = h.coordinator.ledger.tenant(&acme).unwrap();
    assert_eq!(tenant.remaining_training_minutes, 120);
    assert_eq!(tenant.daily.videos_uploaded, 0);
    assert!(tenant.videos_deleted.is_empty());
    assert!(tenant.videos_tracking_now.is_empty());
}

#[tokio::test]
async fn test_transient_failure_is_retried_within_the_sweep() {
    let h = Harness::new();
    let acme = h.tenant("acme");
    let globex = h.tenant("globex");
    h.store.fail_next_puts(EntityKind::Tenant, acme.as_str(), 1);

    h.coordinator.sweeps.reset_remaining_training_minutes(10).unwrap();
    h.drain().await;
    assert_eq!(balances(&h, &[&acme, &globex]), vec![10, 10]);

    let state = final_state(&admin_record(&h, ActionKind::ResetRemainingTrainingMinutes));
    assert_eq!(state.num_processed, 2);
    assert!(state.failure_counts.is_empty());
}

#[tokio::test]
async fn test_persistent_failure_is_skipped_after_max_attempts() {
    let h = Harness::new();
    let acme = h.tenant("acme");
    let globex = h.tenant("globex");
    h.store.fail_next_puts(EntityKind::Tenant, acme.as_str(), 5);

    h.coordinator.sweeps.reset_remaining_training_minutes(10).unwrap();
    let outcomes = h.drain().await;
    assert_eq!(outcomes, vec![DispatchOutcome::Finished]);
    assert_eq!(balances(&h, &[&acme, &globex]), vec![120, 10]);

    let state = final_state(&admin_record(&h, ActionKind::ResetRemainingTrainingMinutes));
    assert_eq!(state.processed, vec!["globex".to_string()]);
    assert_eq!(state.failure_counts.get("acme"), Some(&2));
}

#[tokio::test]
async fn test_processed_tenants_are_skipped_on_resume() {
    let h = Harness::new();
    let acme = h.tenant("acme");
    let globex = h.tenant("globex");
    let initech = h.tenant("initech");

    let mut params = h
        .coordinator
        .actions
        .create(None, ActionKind::IncrementRemainingTrainingMinutes)
        .unwrap();
    params.set_field("increment_minutes", 5).unwrap();
    SweepState {
        processed: vec!["acme".into()],
        num_processed: 1,
        ..SweepState::default()
    }
    .write_into(&mut params)
    .unwrap();

    let time_limit = h.coordinator.actions.time_limit();
    let outcome = h
        .coordinator
        .dispatcher
        .perform_action(params, time_limit)
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Finished);
    assert_eq!(balances(&h, &[&acme, &globex, &initech]), vec![120, 125, 125]);
    let state = final_state(&admin_record(&h, ActionKind::IncrementRemainingTrainingMinutes));
    assert_eq!(state.num_processed, 3);
}

#[tokio::test]
async fn test_sweep_near_time_limit_retriggers_and_resumes() {
    let h = Harness::new();
    let acme = h.tenant("acme");
    let globex = h.tenant("globex");

    let mut params = h
        .coordinator
        .actions
        .create(None, ActionKind::ResetRemainingTrainingMinutes)
        .unwrap();
    params.set_field("reset_minutes", 42).unwrap();
    let nearly_out = h.clock.now() + Duration::seconds(30);
    let outcome = h
        .coordinator
        .dispatcher
        .perform_action(params, nearly_out)
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Retriggered);
    assert_eq!(balances(&h, &[&acme, &globex]), vec![120, 120]);
    assert_eq!(
        admin_record(&h, ActionKind::ResetRemainingTrainingMinutes).state,
        ActionState::Stopped
    );

    let outcomes = h.drain().await;
    assert_eq!(outcomes, vec![DispatchOutcome::Finished]);
    assert_eq!(balances(&h, &[&acme, &globex]), vec![42, 42]);
    let record = admin_record(&h, ActionKind::ResetRemainingTrainingMinutes);
    assert_eq!(record.start_times.len(), 2);
    assert_eq!(record.stop_times.len(), 2);
    assert_eq!(final_state(&record).num_processed, 2);
}

#[tokio::test]
async fn test_admin_action_rejects_wrong_fields() {
    let h = Harness::new();
    h.tenant("acme");
    h.coordinator
        .actions
        .trigger_new(None, ActionKind::ResetRemainingTrainingMinutes, json!({ "reset_minutes": "lots" }))
        .unwrap();
    let outcomes = h.drain().await;
    assert!(matches!(&outcomes[..], [DispatchOutcome::Failed(message)] if message.contains("reset_minutes")));
}

#[tokio::test]
async fn test_season_snapshot_records_each_tenants_models() {
    let h = Harness::new();
    let acme = h.tenant("acme");
    h.tenant("globex");
    start_models(&h, &acme, &["first", "second"]).await;

    h.coordinator.sweeps.save_season_snapshot("2026").unwrap();
    assert_eq!(h.drain().await, vec![DispatchOutcome::Finished]);

    let sweeps = &h.coordinator.sweeps;
    let snapshot = sweeps.season_snapshot("2026", "acme").unwrap().expect("acme snapshot");
    assert_eq!(snapshot.tenant_id, acme);
    assert_eq!(snapshot.model_names, vec!["first".to_string(), "second".to_string()]);
    assert!(snapshot.trained_checkpoints.is_empty());
    let empty = sweeps.season_snapshot("2026", "globex").unwrap().expect("globex snapshot");
    assert!(empty.model_names.is_empty());
    assert!(sweeps.season_snapshot("2025", "acme").unwrap().is_none());

    let state = final_state(&admin_record(&h, ActionKind::SaveSeasonSnapshot));
    assert_eq!(state.num_processed, 2);
    assert_eq!(state.num_items, 2);
}

#[tokio::test]
async fn test_season_snapshot_is_rewritten_for_the_same_season() {
    let h = Harness::new();
    let acme = h.tenant("acme");
    h.coordinator.sweeps.save_season_snapshot("2026").unwrap();
    h.drain().await;
    start_models(&h, &acme, &["late"]).await;

    h.coordinator.sweeps.save_season_snapshot("2026").unwrap();
    h.drain().await;
    let snapshot = h.coordinator.sweeps.season_snapshot("2026", "acme").unwrap().unwrap();
    assert_eq!(snapshot.model_names, vec!["late".to_string()]);
    assert_eq!(h.store.count(EntityKind::SeasonSnapshot), 1);
}

#[tokio::test]
async fn test_season_snapshot_skips_tenant_after_max_attempts() {
    let h = Harness::new();
    h.tenant("acme");
    h.tenant("globex");
    h.store.fail_next_puts(EntityKind::SeasonSnapshot, "acme", 5);

    h.coordinator.sweeps.save_season_snapshot("2026").unwrap();
    assert_eq!(h.drain().await, vec![DispatchOutcome::Finished]);
    assert!(h.coordinator.sweeps.season_snapshot("2026", "acme").unwrap().is_none());
    assert!(h.coordinator.sweeps.season_snapshot("2026", "globex").unwrap().is_some());
    let state = final_state(&admin_record(&h, ActionKind::SaveSeasonSnapshot));
    assert_eq!(state.processed, vec!["globex".to_string()]);
    assert_eq!(state.failure_counts.get("acme"), Some(&2));
}

#[tokio::test]
async fn test_season_snapshot_near_time_limit_retriggers_and_resumes() {
    let h = Harness::new();
    let acme = h.tenant("acme");
    h.tenant("globex");
    start_models(&h, &acme, &["only"]).await;

    let mut params = h
        .coordinator
        .actions
        .create(None, ActionKind::SaveSeasonSnapshot)
        .unwrap();
    params.set_field("season", "2026").unwrap();
    let nearly_out = h.clock.now() + Duration::seconds(30);
    let outcome = h
        .coordinator
        .dispatcher
        .perform_action(params, nearly_out)
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Retriggered);
    assert_eq!(h.store.count(EntityKind::SeasonSnapshot), 0);
    assert_eq!(
        admin_record(&h, ActionKind::SaveSeasonSnapshot).state,
        ActionState::Stopped
    );

    assert_eq!(h.drain().await, vec![DispatchOutcome::Finished]);
    assert_eq!(h.store.count(EntityKind::SeasonSnapshot), 2);
    let record = admin_record(&h, ActionKind::SaveSeasonSnapshot);
    assert_eq!(record.start_times.len(), 2);
    let state = final_state(&record);
    assert_eq!(state.num_processed, 2);
    assert_eq!(state.num_items, 1);
}

#[test]
fn test_season_snapshot_requires_a_season() {
    let h = Harness::new();
    assert!(matches!(
        h.coordinator.sweeps.save_season_snapshot("  "),
        Err(CoordinatorError::BadInput(_))
    ));
}
