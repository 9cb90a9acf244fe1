//! Sharded progress: per-shard writes, exactly-once finalization, cleanup.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{count_finished, Harness};
use futures::future::join_all;
use rand::seq::SliceRandom;
use training_coordinator::core::aggregator::ShardProgressRecord;
use training_coordinator::core::{CoordinatorError, DatasetZipRecord, FinalizeOutcome, ShardResult, ShardScope};
use training_coordinator::infra::store::{EntityKind, StoreExt};
use training_coordinator::util::{Clock, DatasetId, TenantId, ZipId};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Save an unfinalized archive parent and return its scope.
fn archive_parent(h: &Harness, tenant: &TenantId, partitions: u32) -> (ShardScope, DatasetZipRecord) {
    let zip = DatasetZipRecord {
        tenant_id: tenant.clone(),
        zip_id: ZipId::generate(),
        dataset_id: DatasetId::generate(),
        partition_count: partitions,
        completed: false,
        blob_names: Vec::new(),
        partition_file_counts: Vec::new(),
        create_time: h.clock.now(),
        delete_in_progress: false,
    };
    h.store.save(&zip).unwrap();
    (ShardScope::new(tenant, zip.zip_id.as_str()), zip)
}

fn shard_result(index: u32, items: u64, labels: &[(&str, u64)]) -> ShardResult {
    ShardResult {
        group: "train".into(),
        blob_name: Some(format!("part-{index}.json")),
        item_count: items,
        negative_count: 0,
        label_counts: labels
            .iter()
            .map(|(l, c)| ((*l).to_string(), *c))
            .collect::<BTreeMap<_, _>>(),
    }
}

fn load_parent(h: &Harness, zip: &DatasetZipRecord) -> DatasetZipRecord {
    h.store
        .load(&DatasetZipRecord::key_for(&zip.tenant_id, &zip.zip_id))
        .unwrap()
        .unwrap()
}

// ============================================================================
// TESTS
// ============================================================================

#[test]
fn test_finalize_waits_for_every_shard() {
    let h = Harness::new();
    let tenant = h.tenant("acme");
    let (scope, zip) = archive_parent(&h, &tenant, 3);
    let shards = &h.coordinator.shards;
    let key = DatasetZipRecord::key_for(&tenant, &zip.zip_id);
    shards.begin(&scope, 3).unwrap();

    assert_eq!(
        shards.try_finalize::<DatasetZipRecord>(&scope, &key, 3).unwrap(),
        FinalizeOutcome::NotDone { found: 3, completed: 0 }
    );
    shards.mark_shard_complete(&scope, 0, shard_result(0, 2, &[("bird", 2)])).unwrap();
    shards.mark_shard_complete(&scope, 2, shard_result(2, 1, &[("cat", 1)])).unwrap();
    assert_eq!(
        shards.try_finalize::<DatasetZipRecord>(&scope, &key, 3).unwrap(),
        FinalizeOutcome::NotDone { found: 3, completed: 2 }
    );
    assert!(!load_parent(&h, &zip).completed);

    shards.mark_shard_complete(&scope, 1, shard_result(1, 4, &[("bird", 1)])).unwrap();
    match shards.try_finalize::<DatasetZipRecord>(&scope, &key, 3).unwrap() {
        FinalizeOutcome::Finalized(aggregate) => {
            assert_eq!(aggregate.shard_count, 3);
            assert_eq!(aggregate.group("train").item_count, 7);
            assert_eq!(aggregate.group("train").label_counts["bird"], 3);
        }
        other => panic!("expected finalized, got {other:?}"),
    }
    let parent = load_parent(&h, &zip);
    assert!(parent.completed);
    assert_eq!(parent.blob_names, vec!["part-0.json", "part-1.json", "part-2.json"]);
    assert_eq!(parent.partition_file_counts, vec![2, 4, 1]);

    assert_eq!(
        shards.try_finalize::<DatasetZipRecord>(&scope, &key, 3).unwrap(),
        FinalizeOutcome::AlreadyFinalized
    );
}

#[test]
fn test_missing_shards_are_not_done() {
    let h = Harness::new();
    let tenant = h.tenant("acme");
    let (scope, zip) = archive_parent(&h, &tenant, 4);
    let key = DatasetZipRecord::key_for(&tenant, &zip.zip_id);
    h.coordinator.shards.begin(&scope, 2).unwrap();
    h.coordinator
        .shards
        .mark_shard_complete(&scope, 0, shard_result(0, 1, &[]))
        .unwrap();
    h.coordinator
        .shards
        .mark_shard_complete(&scope, 1, shard_result(1, 1, &[]))
        .unwrap();

    assert_eq!(
        h.coordinator
            .shards
            .try_finalize::<DatasetZipRecord>(&scope, &key, 4)
            .unwrap(),
        FinalizeOutcome::NotDone { found: 2, completed: 2 }
    );
}

#[test]
fn test_zero_shards_finalize_without_cleanup() {
    let h = Harness::new();
    let tenant = h.tenant("acme");
    let (scope, zip) = archive_parent(&h, &tenant, 0);
    let key = DatasetZipRecord::key_for(&tenant, &zip.zip_id);

    let outcome = h
        .coordinator
        .shards
        .try_finalize::<DatasetZipRecord>(&scope, &key, 0)
        .unwrap();
    assert!(matches!(outcome, FinalizeOutcome::Finalized(ref a) if a.shard_count == 0));
    assert!(load_parent(&h, &zip).completed);
    assert!(h.events.try_recv().is_err());
}

#[test]
fn test_missing_parent_is_not_found() {
    let h = Harness::new();
    let tenant = h.tenant("acme");
    let scope = ShardScope::new(&tenant, "nobody");
    let key = DatasetZipRecord::key_for(&tenant, &ZipId::generate());
    assert!(matches!(
        h.coordinator.shards.try_finalize::<DatasetZipRecord>(&scope, &key, 1),
        Err(CoordinatorError::NotFound(_))
    ));
}

#[test]
fn test_update_shard_tracks_progress() {
    let h = Harness::new();
    let tenant = h.tenant("acme");
    let (scope, _) = archive_parent(&h, &tenant, 2);
    let shards = &h.coordinator.shards;
    shards.begin_with_totals(&scope, &[10, 5]).unwrap();

    shards.update_shard(&scope, 0, 4, None).unwrap();
    shards.update_shard(&scope, 1, 2, Some(6)).unwrap();
    let progress: Vec<ShardProgressRecord> = shards.progress_by_shard(&scope, 2).unwrap();
    assert_eq!(
        progress.iter().map(|p| (p.progress, p.total)).collect::<Vec<_>>(),
        vec![(4, 10), (2, 6)]
    );
    assert_eq!(shards.progress_total(&scope).unwrap(), 6);

    assert!(matches!(
        shards.update_shard(&scope, 7, 1, None),
        Err(CoordinatorError::NotFound(_))
    ));
    assert!(matches!(
        shards.progress_by_shard(&scope, 3),
        Err(CoordinatorError::NotFound(_))
    ));
}

#[test]
fn test_shards_are_created_in_batches() {
    let mut config = training_coordinator::config::CoordinatorConfig::default();
    config.shards.create_batch_size = 3;
    let h = Harness::with_config(config);
    let tenant = h.tenant("acme");
    let (scope, _) = archive_parent(&h, &tenant, 10);

    h.coordinator.shards.begin(&scope, 10).unwrap();
    assert_eq!(h.store.count(EntityKind::ShardProgress), 10);
    assert_eq!(h.store.count(EntityKind::ShardResult), 10);
    assert_eq!(h.coordinator.shards.results(&scope, 100).unwrap().len(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_finalize_happens_once() {
    let h = Harness::new();
    let tenant = h.tenant("acme");
    let (scope, zip) = archive_parent(&h, &tenant, 16);
    let key = DatasetZipRecord::key_for(&tenant, &zip.zip_id);
    let shards = Arc::clone(&h.coordinator.shards);
    shards.begin(&scope, 16).unwrap();

    let mut order: Vec<u32> = (0..16).collect();
    order.shuffle(&mut rand::rng());

    // Every worker marks its own shard complete and then attempts the finalize.
    let tasks = order.into_iter().map(|index| {
        let shards = Arc::clone(&shards);
        let scope = scope.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || {
            shards.mark_shard_complete(&scope, index, shard_result(index, 1, &[("bird", 1)]))?;
            shards.try_finalize::<DatasetZipRecord>(&scope, &key, 16)
        })
    });
    let outcomes: Vec<FinalizeOutcome> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let finalized: Vec<_> = outcomes
        .iter()
        .filter(|o| matches!(o, FinalizeOutcome::Finalized(_)))
        .collect();
    assert_eq!(finalized.len(), 1);
    if let FinalizeOutcome::Finalized(aggregate) = finalized[0] {
        assert_eq!(aggregate.group("train").label_counts["bird"], 16);
        assert_eq!(aggregate.blob_names.len(), 16);
    }
    assert!(load_parent(&h, &zip).completed);
}

#[tokio::test]
async fn test_finalize_schedules_progress_cleanup() {
    let mut config = training_coordinator::config::CoordinatorConfig::default();
    config.actions.delete_page_size = 2;
    let h = Harness::with_config(config);
    let tenant = h.tenant("acme");
    let (scope, zip) = archive_parent(&h, &tenant, 5);
    let key = DatasetZipRecord::key_for(&tenant, &zip.zip_id);
    let shards = &h.coordinator.shards;
    shards.begin(&scope, 5).unwrap();
    for index in 0..5 {
        shards.mark_shard_complete(&scope, index, shard_result(index, 1, &[])).unwrap();
    }
    assert!(shards
        .try_finalize::<DatasetZipRecord>(&scope, &key, 5)
        .unwrap()
        .is_done());

    let outcomes = h.drain().await;
    assert_eq!(count_finished(&outcomes), 1);
    assert_eq!(h.store.count(EntityKind::ShardProgress), 0);
    assert_eq!(h.store.count(EntityKind::ShardResult), 5);
    assert_eq!(shards.progress_total(&scope).unwrap(), 0);

    assert_eq!(shards.delete_results_page(&scope, 3).unwrap(), 3);
    assert_eq!(shards.delete_results_page(&scope, 3).unwrap(), 2);
    assert_eq!(shards.delete_results_page(&scope, 3).unwrap(), 0);
}
