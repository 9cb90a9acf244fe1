//! Sharded progress aggregation.
//!
//! A parent (a dataset, an archive) owns a fixed number of shards, each with
//! an independent progress record and an independent result record. Workers
//! update only their own shard. [`ShardedProgress::try_finalize`] scans the
//! result records and, once every expected shard reports completion, combines
//! them onto the parent exactly once, guarded by the parent's completed flag.
//! Progress records are then deleted by a `DeleteShardProgress` action.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use super::action::{ActionKind, ActionParams, ActionProtocol};
use super::error::{CoordinatorError, CoordinatorResult};
use super::executor::ActionHandler;
use crate::config::ShardConfig;
use crate::infra::store::{
    run_transaction, Entity, EntityKey, EntityKind, EntityStore, Query, StoreExt, TransactionExt,
};
use crate::util::{Clock, TenantId};

/// Parent a set of shards belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardScope {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Parent resource id (dataset id, zip id).
    pub parent_id: String,
}

impl ShardScope {
    /// Scope for `parent_id` owned by `tenant_id`.
    pub fn new(tenant_id: &TenantId, parent_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.clone(),
            parent_id: parent_id.into(),
        }
    }

    fn group(&self) -> String {
        format!("{}/{}", self.tenant_id, self.parent_id)
    }

    fn shard_name(index: u32) -> String {
        format!("{index:08}")
    }
}

/// Monotonic progress counter for one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardProgressRecord {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Parent resource id.
    pub parent_id: String,
    /// Shard index.
    pub shard_index: u32,
    /// Units written so far.
    pub progress: u64,
    /// Units this shard will write.
    pub total: u64,
    /// Last update.
    pub update_time: DateTime<Utc>,
}

impl ShardProgressRecord {
    /// Address of a shard's progress record.
    #[must_use]
    pub fn key_for(scope: &ShardScope, index: u32) -> EntityKey {
        EntityKey::new(EntityKind::ShardProgress, scope.group(), ShardScope::shard_name(index))
    }
}

impl Entity for ShardProgressRecord {
    fn key(&self) -> EntityKey {
        Self::key_for(&ShardScope::new(&self.tenant_id, self.parent_id.clone()), self.shard_index)
    }
}

/// What one completed shard contributes to the aggregate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardResult {
    /// Aggregation group, e.g. `train` or `eval`.
    pub group: String,
    /// Blob produced by the shard, if any.
    pub blob_name: Option<String>,
    /// Items written.
    pub item_count: u64,
    /// Items without any label.
    pub negative_count: u64,
    /// Occurrences per label.
    pub label_counts: BTreeMap<String, u64>,
}

/// Completion flag plus result payload for one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardResultRecord {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Parent resource id.
    pub parent_id: String,
    /// Shard index.
    pub shard_index: u32,
    /// Set by the shard's terminal write.
    pub completed: bool,
    /// Present once completed.
    pub result: Option<ShardResult>,
}

impl ShardResultRecord {
    /// Address of a shard's result record.
    #[must_use]
    pub fn key_for(scope: &ShardScope, index: u32) -> EntityKey {
        EntityKey::new(EntityKind::ShardResult, scope.group(), ShardScope::shard_name(index))
    }
}

impl Entity for ShardResultRecord {
    fn key(&self) -> EntityKey {
        Self::key_for(&ShardScope::new(&self.tenant_id, self.parent_id.clone()), self.shard_index)
    }
}

/// Sums for one aggregation group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTotals {
    /// Items across shards.
    pub item_count: u64,
    /// Unlabeled items across shards.
    pub negative_count: u64,
    /// Merged label counts.
    pub label_counts: BTreeMap<String, u64>,
}

/// Combined result of every shard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    /// Shards combined.
    pub shard_count: u32,
    /// Totals per group.
    pub groups: BTreeMap<String, GroupTotals>,
    /// Shard blobs in shard order.
    pub blob_names: Vec<String>,
    /// Items per shard, in shard order.
    pub shard_item_counts: Vec<u64>,
}

impl Aggregate {
    /// Combine completed shard results in shard order.
    #[must_use]
    pub fn combine(records: &[ShardResultRecord]) -> Self {
        let mut ordered: Vec<&ShardResultRecord> = records.iter().collect();
        ordered.sort_by_key(|r| r.shard_index);
        let mut aggregate = Self {
            shard_count: u32::try_from(ordered.len()).unwrap_or(u32::MAX),
            ..Self::default()
        };
        for result in ordered.iter().filter_map(|r| r.result.as_ref()) {
            aggregate.shard_item_counts.push(result.item_count);
            let totals = aggregate.groups.entry(result.group.clone()).or_default();
            totals.item_count += result.item_count;
            totals.negative_count += result.negative_count;
            merge_label_counts(&mut totals.label_counts, &result.label_counts);
            if let Some(blob) = &result.blob_name {
                aggregate.blob_names.push(blob.clone());
            }
        }
        aggregate
    }

    /// Totals for `group`, empty when no shard reported it.
    #[must_use]
    pub fn group(&self, group: &str) -> GroupTotals {
        self.groups.get(group).cloned().unwrap_or_default()
    }
}

/// Add every count in `from` into `into`.
pub fn merge_label_counts(into: &mut BTreeMap<String, u64>, from: &BTreeMap<String, u64>) {
    for (label, count) in from {
        *into.entry(label.clone()).or_insert(0) += count;
    }
}

/// Entity that receives the aggregate of its shards.
pub trait ShardParent: Entity {
    /// Whether the aggregate has already been written.
    fn is_finalized(&self) -> bool;
    /// Write the aggregate and set the completed flag.
    fn finalize(&mut self, aggregate: &Aggregate, now: DateTime<Utc>);
}

/// Result of a finalize attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Not every expected shard is present and complete yet.
    NotDone {
        /// Shard result records found.
        found: u32,
        /// Found records carrying the completion flag.
        completed: u32,
    },
    /// This call wrote the aggregate.
    Finalized(Aggregate),
    /// An earlier call already wrote the aggregate.
    AlreadyFinalized,
}

impl FinalizeOutcome {
    /// Whether the parent is finalized, by this call or an earlier one.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        !matches!(self, Self::NotDone { .. })
    }
}

/// Creates, updates, and finalizes shard sets.
pub struct ShardedProgress {
    store: Arc<dyn EntityStore>,
    actions: Arc<ActionProtocol>,
    clock: Arc<dyn Clock>,
    config: ShardConfig,
}

impl ShardedProgress {
    /// Create the aggregator.
    pub fn new(
        store: Arc<dyn EntityStore>,
        actions: Arc<ActionProtocol>,
        clock: Arc<dyn Clock>,
        config: ShardConfig,
    ) -> Self {
        Self {
            store,
            actions,
            clock,
            config,
        }
    }

    fn attempts(&self) -> u32 {
        self.actions.config().transaction_attempts
    }

    /// Create `shard_count` shards with zero progress and completion unset.
    /// Must run before any producer writes.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn begin(&self, scope: &ShardScope, shard_count: u32) -> CoordinatorResult<()> {
        self.begin_with_totals(scope, &vec![0; shard_count as usize])
    }

    /// Like [`Self::begin`], with shard `i` expecting `totals[i]` units.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn begin_with_totals(&self, scope: &ShardScope, totals: &[u64]) -> CoordinatorResult<()> {
        let now = self.clock.now();
        let mut index = 0_u32;
        for batch in totals.chunks(self.config.create_batch_size.max(1)) {
            let mut entries = Vec::with_capacity(batch.len() * 2);
            for total in batch {
                let progress = ShardProgressRecord {
                    tenant_id: scope.tenant_id.clone(),
                    parent_id: scope.parent_id.clone(),
                    shard_index: index,
                    progress: 0,
                    total: *total,
                    update_time: now,
                };
                let result = ShardResultRecord {
                    tenant_id: scope.tenant_id.clone(),
                    parent_id: scope.parent_id.clone(),
                    shard_index: index,
                    completed: false,
                    result: None,
                };
                entries.push((progress.key(), serde_json::to_value(&progress)?));
                entries.push((result.key(), serde_json::to_value(&result)?));
                index += 1;
            }
            self.store.put_multi(entries)?;
        }
        debug!(parent = %scope.parent_id, shards = index, "shards created");
        Ok(())
    }

    /// Overwrite one shard's progress and, when given, its expected total.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the shard was never created.
    pub fn update_shard(&self, scope: &ShardScope, index: u32, progress: u64, total: Option<u64>) -> CoordinatorResult<()> {
        let key = ShardProgressRecord::key_for(scope, index);
        let now = self.clock.now();
        run_transaction(self.store.as_ref(), self.attempts(), |txn| {
            let mut record: ShardProgressRecord = txn.load(&key)?.ok_or_else(|| {
                CoordinatorError::NotFound(format!("shard {index} of {}", scope.parent_id))
            })?;
            record.progress = progress;
            if let Some(total) = total {
                record.total = total;
            }
            record.update_time = now;
            txn.save(&record)
        })
    }

    /// Terminal write for a shard: set its completion flag and result.
    /// Repeating it with the same result is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the shard was never created.
    pub fn mark_shard_complete(&self, scope: &ShardScope, index: u32, result: ShardResult) -> CoordinatorResult<()> {
        let key = ShardResultRecord::key_for(scope, index);
        run_transaction(self.store.as_ref(), self.attempts(), |txn| {
            let mut record: ShardResultRecord = txn.load(&key)?.ok_or_else(|| {
                CoordinatorError::NotFound(format!("shard {index} of {}", scope.parent_id))
            })?;
            record.completed = true;
            record.result = Some(result.clone());
            txn.save(&record)
        })
    }

    /// Combine every shard onto the parent at `parent_key` once all
    /// `expected` shards are present and complete.
    ///
    /// Fewer shards than expected, or incomplete ones, yield `NotDone`, never
    /// an error. Zero expected shards finalize immediately without scanning.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the parent is missing, or a store failure.
    pub fn try_finalize<P: ShardParent>(
        &self,
        scope: &ShardScope,
        parent_key: &EntityKey,
        expected: u32,
    ) -> CoordinatorResult<FinalizeOutcome> {
        let now = self.clock.now();
        let outcome = run_transaction(self.store.as_ref(), self.attempts(), |txn| {
            let mut parent: P = txn
                .load(parent_key)?
                .ok_or_else(|| CoordinatorError::NotFound(format!("parent {}", scope.parent_id)))?;
            if parent.is_finalized() {
                return Ok(FinalizeOutcome::AlreadyFinalized);
            }
            let aggregate = if expected == 0 {
                Aggregate::default()
            } else {
                let query = Query::kind(EntityKind::ShardResult)
                    .in_group(scope.group())
                    .limit(expected as usize);
                let records: Vec<ShardResultRecord> = txn.find(&query)?;
                let found = u32::try_from(records.len()).unwrap_or(u32::MAX);
                let completed = u32::try_from(records.iter().filter(|r| r.completed).count())
                    .unwrap_or(u32::MAX);
                if found < expected || completed < found {
                    return Ok(FinalizeOutcome::NotDone { found, completed });
                }
                Aggregate::combine(&records)
            };
            parent.finalize(&aggregate, now);
            txn.save(&parent)?;
            Ok(FinalizeOutcome::Finalized(aggregate))
        })?;
        if let FinalizeOutcome::Finalized(aggregate) = &outcome {
            info!(parent = %scope.parent_id, shards = aggregate.shard_count, "shards finalized");
            if expected > 0 {
                self.schedule_progress_cleanup(scope)?;
            }
        }
        Ok(outcome)
    }

    /// Trigger deletion of a finalized parent's progress records.
    ///
    /// # Errors
    ///
    /// Propagates store or blob failures.
    pub fn schedule_progress_cleanup(&self, scope: &ShardScope) -> CoordinatorResult<ActionParams> {
        self.actions.trigger_new(
            Some(&scope.tenant_id),
            ActionKind::DeleteShardProgress,
            json!({ "parent_id": scope.parent_id }),
        )
    }

    /// Progress records in shard order.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when fewer than `count` shards exist.
    pub fn progress_by_shard(&self, scope: &ShardScope, count: u32) -> CoordinatorResult<Vec<ShardProgressRecord>> {
        let query = Query::kind(EntityKind::ShardProgress)
            .in_group(scope.group())
            .order_by("shard_index")
            .limit(count as usize);
        let records: Vec<ShardProgressRecord> = self.store.find(&query)?;
        if records.len() < count as usize {
            return Err(CoordinatorError::NotFound(format!(
                "{} of {count} shards of {} found",
                records.len(),
                scope.parent_id
            )));
        }
        Ok(records)
    }

    /// Sum of progress across the shards that still have progress records.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn progress_total(&self, scope: &ShardScope) -> CoordinatorResult<u64> {
        let query = Query::kind(EntityKind::ShardProgress).in_group(scope.group());
        let records: Vec<ShardProgressRecord> = self.store.find(&query)?;
        Ok(records.iter().map(|r| r.progress).sum())
    }

    /// Up to `limit` result records, in shard order.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn results(&self, scope: &ShardScope, limit: usize) -> CoordinatorResult<Vec<ShardResultRecord>> {
        let query = Query::kind(EntityKind::ShardResult)
            .in_group(scope.group())
            .order_by("shard_index")
            .limit(limit);
        self.store.find(&query)
    }

    /// Delete one page of progress records. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn delete_progress_page(&self, scope: &ShardScope, page_size: usize) -> CoordinatorResult<usize> {
        let query = Query::kind(EntityKind::ShardProgress)
            .in_group(scope.group())
            .limit(page_size);
        let keys: Vec<EntityKey> = self.store.query(&query)?.into_iter().map(|(k, _)| k).collect();
        self.store.delete_multi(&keys)?;
        Ok(keys.len())
    }

    /// Delete one page of result records. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn delete_results_page(&self, scope: &ShardScope, page_size: usize) -> CoordinatorResult<usize> {
        let keys: Vec<EntityKey> = self
            .results(scope, page_size)?
            .iter()
            .map(Entity::key)
            .collect();
        self.store.delete_multi(&keys)?;
        Ok(keys.len())
    }
}

#[async_trait]
impl ActionHandler for ShardedProgress {
    async fn perform(&self, params: ActionParams, time_limit: DateTime<Utc>) -> CoordinatorResult<ActionParams> {
        let scope = ShardScope::new(params.tenant()?, params.field::<String>("parent_id")?);
        let page_size = self.actions.config().delete_page_size;
        loop {
            self.actions.retrigger_if_necessary(&params, time_limit)?;
            if self.delete_progress_page(&scope, page_size)? == 0 {
                break;
            }
        }
        debug!(parent = %scope.parent_id, "shard progress deleted");
        Ok(params)
    }
}
