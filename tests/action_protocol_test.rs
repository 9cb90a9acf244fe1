//! Action lifecycle: triggering, dispatch, retention, and at-least-once
//! delivery.

mod common;

use chrono::Duration;
use common::Harness;
use serde_json::json;
use training_coordinator::core::{ActionKind, ActionState, CoordinatorError};
use training_coordinator::infra::BlobStore;
use training_coordinator::runtime::DispatchOutcome;
use training_coordinator::util::Clock;

#[tokio::test]
async fn test_ordinary_action_is_deleted_when_finished() {
    let h = Harness::new();
    let tenant = h.tenant("acme");
    let video = h.labeled_video(&tenant, 3, 0);
    h.coordinator.videos.delete_video(&tenant, &video).unwrap();

    let pending = h.coordinator.actions.list_actions(Some(&tenant), None).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, ActionKind::DeleteVideo);
    assert_eq!(pending[0].state, ActionState::Created);

    assert_eq!(h.drain().await, vec![DispatchOutcome::Finished]);
    assert!(h.coordinator.actions.list_actions(Some(&tenant), None).unwrap().is_empty());
    let id = pending[0].action_id.to_string();
    assert_eq!(
        h.audit.lock().transitions_for(&id),
        vec!["create", "trigger", "start", "finish"]
    );
}

#[tokio::test]
async fn test_audit_events_use_coordinator_clock() {
    let h = Harness::new();
    let tenant = h.tenant("acme");
    let video = h.labeled_video(&tenant, 3, 0);
    let created_at = h.clock.now();
    h.coordinator.videos.delete_video(&tenant, &video).unwrap();

    h.clock.advance(Duration::minutes(5));
    let started_at = h.clock.now();
    assert_eq!(h.drain().await, vec![DispatchOutcome::Finished]);

    let events = h.audit.lock().events();
    let create = events.iter().find(|e| e.transition == "create").expect("create");
    let finish = events.iter().find(|e| e.transition == "finish").expect("finish");
    assert_eq!(create.created_at_ms, created_at.timestamp_millis());
    assert_eq!(finish.created_at_ms, started_at.timestamp_millis());
}

#[tokio::test]
async fn test_admin_action_is_kept_with_final_params() {
    let h = Harness::new();
    h.tenant("acme");
    let params = h.coordinator.sweeps.reset_remaining_training_minutes(30).unwrap();
    assert!(params.tenant_id.is_none());

    assert_eq!(h.drain().await, vec![DispatchOutcome::Finished]);
    let record = h
        .coordinator
        .actions
        .action(&params.action_id, ActionKind::ResetRemainingTrainingMinutes)
        .unwrap()
        .expect("admin record kept");
    assert_eq!(record.state, ActionState::Finished);
    assert_eq!(record.start_times.len(), 1);
    assert_eq!(record.stop_times.len(), 1);
    let kept = record.params.expect("final params");
    assert_eq!(kept.field::<u64>("num_processed").unwrap(), 1);
}

#[tokio::test]
async fn test_duplicate_event_runs_once() {
    let h = Harness::new();
    let tenant = h.tenant("acme");
    let video = h.labeled_video(&tenant, 3, 0);
    h.coordinator.videos.delete_video(&tenant, &video).unwrap();

    let event = h.events.try_recv().expect("event");
    let dispatcher = &h.coordinator.dispatcher;
    assert_eq!(
        dispatcher.handle_event(&event.bucket, &event.name).await.unwrap(),
        DispatchOutcome::Finished
    );
    assert_eq!(
        dispatcher.handle_event(&event.bucket, &event.name).await.unwrap(),
        DispatchOutcome::Ignored
    );
}

#[tokio::test]
async fn test_event_from_other_bucket_is_ignored() {
    let h = Harness::new();
    let outcome = h
        .coordinator
        .dispatcher
        .handle_event("artifacts", "whatever.json")
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Ignored);
}

#[tokio::test]
async fn test_event_for_removed_record_is_ignored() {
    let h = Harness::new();
    let tenant = h.tenant("acme");
    let params = h
        .coordinator
        .actions
        .trigger_new(Some(&tenant), ActionKind::DeleteModel, json!({ "model_id": "00" }))
        .unwrap();
    let record = h
        .coordinator
        .actions
        .action(&params.action_id, params.kind)
        .unwrap()
        .unwrap();
    h.coordinator.actions.remove_action(&record).unwrap();

    assert_eq!(h.drain().await, vec![DispatchOutcome::Ignored]);
}

#[tokio::test]
async fn test_failed_body_records_stop() {
    let h = Harness::new();
    let tenant = h.tenant("acme");
    let params = h
        .coordinator
        .actions
        .trigger_new(Some(&tenant), ActionKind::DeleteVideo, json!({}))
        .unwrap();

    let outcomes = h.drain().await;
    assert!(matches!(outcomes.as_slice(), [DispatchOutcome::Failed(msg)] if msg.contains("video_id")));
    let record = h
        .coordinator
        .actions
        .action(&params.action_id, params.kind)
        .unwrap()
        .expect("failed record kept");
    assert_eq!(record.state, ActionState::Stopped);
    assert_eq!(record.stop_times.len(), 1);
}

#[tokio::test]
async fn test_params_blob_is_consumed() {
    let h = Harness::new();
    let tenant = h.tenant("acme");
    let bucket = h.coordinator.config.actions.parameters_bucket.clone();
    h.coordinator
        .actions
        .trigger_new(Some(&tenant), ActionKind::DeleteModel, json!({ "model_id": "x" }))
        .unwrap();
    assert_eq!(h.blobs.len(&bucket), 1);
    assert_eq!(h.blobs.content_type(&bucket, &h.blobs.list(&bucket, "").unwrap()[0]).as_deref(), Some("application/json"));

    h.drain().await;
    assert!(h.blobs.is_empty(&bucket));
}

#[test]
fn test_create_validates_tenant_and_fields() {
    let h = Harness::new();
    let actions = &h.coordinator.actions;
    assert!(matches!(
        actions.create(None, ActionKind::DeleteModel),
        Err(CoordinatorError::BadInput(_))
    ));
    assert!(actions.create(None, ActionKind::ResetTenants).is_ok());
    let tenant = h.tenant("acme");
    assert!(matches!(
        actions.trigger_new(Some(&tenant), ActionKind::DeleteModel, json!([1, 2])),
        Err(CoordinatorError::BadInput(_))
    ));
}

#[test]
fn test_retrigger_only_near_time_limit() {
    let h = Harness::new();
    let tenant = h.tenant("acme");
    let actions = &h.coordinator.actions;
    let params = actions.create(Some(&tenant), ActionKind::DeleteModel).unwrap();

    let plenty = h.clock.now() + Duration::seconds(61);
    assert!(actions.retrigger_if_necessary(&params, plenty).is_ok());
    assert!(h.events.try_recv().is_err());

    let tight = h.clock.now() + Duration::seconds(59);
    let err = actions.retrigger_if_necessary(&params, tight).unwrap_err();
    assert!(err.is_retrigger());
    assert!(h.events.try_recv().is_ok());
}

#[test]
fn test_list_actions_orders_by_creation() {
    let h = Harness::new();
    let a = h.tenant("a");
    let b = h.tenant("b");
    let actions = &h.coordinator.actions;
    let first = actions.create(Some(&a), ActionKind::DeleteModel).unwrap();
    h.clock.advance(Duration::seconds(1));
    actions.create(Some(&b), ActionKind::DeleteModel).unwrap();
    h.clock.advance(Duration::seconds(1));
    let third = actions.create(Some(&a), ActionKind::DeleteVideo).unwrap();

    let for_a: Vec<_> = actions
        .list_actions(Some(&a), None)
        .unwrap()
        .into_iter()
        .map(|r| r.action_id)
        .collect();
    assert_eq!(for_a, vec![first.action_id, third.action_id]);
    assert_eq!(actions.list_actions(None, Some(ActionKind::DeleteModel)).unwrap().len(), 2);
}

#[test]
fn test_event_loop_dispatches_on_spawner() {
    use std::sync::Arc;
    use std::time::{Duration as StdDuration, Instant};
    use training_coordinator::runtime::TokioSpawner;

    let h = Harness::new();
    let acme = h.tenant("acme");
    h.coordinator.sweeps.reset_remaining_training_minutes(30).unwrap();

    let (tx, rx) = crossbeam_channel::unbounded();
    tx.send(h.events.try_recv().expect("params event")).unwrap();
    drop(tx);

    let spawner = TokioSpawner::with_worker_threads(2).expect("runtime");
    Arc::clone(&h.coordinator.dispatcher).run_event_loop(&rx, &spawner);

    let deadline = Instant::now() + StdDuration::from_secs(5);
    while h.coordinator.ledger.remaining_minutes(&acme).unwrap() != 30 {
        assert!(Instant::now() < deadline, "event was not dispatched");
        std::thread::sleep(StdDuration::from_millis(10));
    }
}
