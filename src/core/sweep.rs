//! Administrative sweeps over every tenant.
//!
//! A sweep keeps its progress inside its own params: `processed` (tenant names
//! already done), `num_processed`, and `failure_counts`. A retriggered
//! execution skips processed names and only retries failed ones, each at most
//! `sweep_max_attempts` times per sweep. `num_items` counts whatever the sweep
//! visits inside each tenant (models, for a season snapshot).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use super::action::{ActionKind, ActionParams, ActionProtocol};
use super::entities::{DailyCounters, TenantRecord};
use super::error::{CoordinatorError, CoordinatorResult};
use super::executor::ActionHandler;
use super::training::ModelRecord;
use crate::infra::store::{
    run_transaction, Entity, EntityKey, EntityKind, EntityStore, Query, StoreExt, TransactionExt,
};
use crate::util::TenantId;

/// Resumable sweep progress carried in action params.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepState {
    /// Tenant names already handled.
    pub processed: Vec<String>,
    /// Count of handled tenants.
    pub num_processed: u64,
    /// Failed attempts per tenant name.
    pub failure_counts: BTreeMap<String, u32>,
    /// Items visited within the handled tenants.
    pub num_items: u64,
}

/// A tenant's models at the end of a season.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonSnapshotRecord {
    /// Season label.
    pub season: String,
    /// Tenant name.
    pub tenant_name: String,
    /// Tenant id.
    pub tenant_id: TenantId,
    /// Model descriptions, oldest first.
    pub model_names: Vec<String>,
    /// Trained checkpoints of those models that have one.
    pub trained_checkpoints: Vec<String>,
}

impl SeasonSnapshotRecord {
    /// Address of one tenant's snapshot for `season`.
    #[must_use]
    pub fn key_for(season: &str, tenant_name: &str) -> EntityKey {
        EntityKey::new(EntityKind::SeasonSnapshot, season, tenant_name)
    }
}

impl Entity for SeasonSnapshotRecord {
    fn key(&self) -> EntityKey {
        Self::key_for(&self.season, &self.tenant_name)
    }
}

impl SweepState {
    /// Read the progress fields from `params`.
    ///
    /// # Errors
    ///
    /// Returns `BadInput` when a field has the wrong shape.
    pub fn from_params(params: &ActionParams) -> CoordinatorResult<Self> {
        Ok(Self {
            processed: params.field_or_default("processed")?,
            num_processed: params.field_or_default("num_processed")?,
            failure_counts: params.field_or_default("failure_counts")?,
            num_items: params.field_or_default("num_items")?,
        })
    }

    /// Write the progress fields into `params`.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` on encoding failure.
    pub fn write_into(&self, params: &mut ActionParams) -> CoordinatorResult<()> {
        params.set_field("processed", &self.processed)?;
        params.set_field("num_processed", self.num_processed)?;
        params.set_field("failure_counts", &self.failure_counts)?;
        params.set_field("num_items", self.num_items)
    }
}

/// Runs the administrative actions.
pub struct AdminSweeps {
    store: Arc<dyn EntityStore>,
    actions: Arc<ActionProtocol>,
    initial_training_minutes: i64,
}

impl AdminSweeps {
    /// Create the sweeper.
    pub fn new(store: Arc<dyn EntityStore>, actions: Arc<ActionProtocol>, initial_training_minutes: i64) -> Self {
        Self {
            store,
            actions,
            initial_training_minutes,
        }
    }

    /// Trigger a sweep setting every balance to `reset_minutes`.
    ///
    /// # Errors
    ///
    /// Propagates store or blob failures.
    pub fn reset_remaining_training_minutes(&self, reset_minutes: i64) -> CoordinatorResult<ActionParams> {
        self.actions.trigger_new(
            None,
            ActionKind::ResetRemainingTrainingMinutes,
            json!({ "reset_minutes": reset_minutes }),
        )
    }

    /// Trigger a sweep adding `increment_minutes` to every balance.
    ///
    /// # Errors
    ///
    /// Propagates store or blob failures.
    pub fn increment_remaining_training_minutes(&self, increment_minutes: i64) -> CoordinatorResult<ActionParams> {
        self.actions.trigger_new(
            None,
            ActionKind::IncrementRemainingTrainingMinutes,
            json!({ "increment_minutes": increment_minutes }),
        )
    }

    /// Trigger a sweep returning every tenant to its initial state.
    ///
    /// # Errors
    ///
    /// Propagates store or blob failures.
    pub fn reset_tenants(&self) -> CoordinatorResult<ActionParams> {
        self.actions.trigger_new(None, ActionKind::ResetTenants, json!({}))
    }

    /// Trigger a sweep recording every tenant's models under `season`.
    ///
    /// # Errors
    ///
    /// Returns `BadInput` for an empty season, or store and blob failures.
    pub fn save_season_snapshot(&self, season: &str) -> CoordinatorResult<ActionParams> {
        if season.trim().is_empty() {
            return Err(CoordinatorError::BadInput("season must not be empty".into()));
        }
        self.actions
            .trigger_new(None, ActionKind::SaveSeasonSnapshot, json!({ "season": season }))
    }

    /// One tenant's snapshot for `season`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn season_snapshot(&self, season: &str, tenant_name: &str) -> CoordinatorResult<Option<SeasonSnapshotRecord>> {
        self.store.load(&SeasonSnapshotRecord::key_for(season, tenant_name))
    }

    fn checkpoint(&self, params: &mut ActionParams, state: &SweepState, time_limit: DateTime<Utc>) -> CoordinatorResult<()> {
        state.write_into(params)?;
        self.actions.retrigger_if_necessary(params, time_limit)
    }

    /// Apply `update` to every tenant not yet processed, one transaction per
    /// tenant.
    ///
    /// # Errors
    ///
    /// Returns `Retriggered` when the time budget runs low, or a store failure
    /// while listing tenants.
    pub fn sweep<F>(&self, params: &mut ActionParams, time_limit: DateTime<Utc>, update: F) -> CoordinatorResult<()>
    where
        F: Fn(&mut TenantRecord),
    {
        self.sweep_each(params, time_limit, |tenant| {
            let key = TenantRecord::key_for(&tenant.tenant_id);
            run_transaction(self.store.as_ref(), 1, |txn| {
                let mut current: TenantRecord = txn
                    .load(&key)?
                    .ok_or_else(|| CoordinatorError::NotFound(format!("tenant {}", tenant.name)))?;
                update(&mut current);
                txn.save(&current)
            })?;
            Ok(0)
        })
    }

    /// Visit every tenant not yet processed, in name order. `visit` returns
    /// how many items it handled; a failed visit is retried on another pass
    /// until the tenant reaches `sweep_max_attempts`.
    ///
    /// # Errors
    ///
    /// Returns `Retriggered` when the time budget runs low, or a store failure
    /// while listing tenants.
    pub fn sweep_each<F>(&self, params: &mut ActionParams, time_limit: DateTime<Utc>, mut visit: F) -> CoordinatorResult<()>
    where
        F: FnMut(&TenantRecord) -> CoordinatorResult<u64>,
    {
        let max_attempts = self.actions.config().sweep_max_attempts;
        let mut state = SweepState::from_params(params)?;
        let mut again = true;
        while again {
            again = false;
            self.checkpoint(params, &state, time_limit)?;
            let tenants: Vec<TenantRecord> =
                self.store.find(&Query::kind(EntityKind::Tenant).order_by("name"))?;
            for tenant in tenants {
                self.checkpoint(params, &state, time_limit)?;
                let name = tenant.name.clone();
                if state.processed.contains(&name) {
                    continue;
                }
                let failures = state.failure_counts.get(&name).copied().unwrap_or(0);
                if failures >= max_attempts {
                    continue;
                }
                match visit(&tenant) {
                    Ok(items) => {
                        state.failure_counts.remove(&name);
                        state.processed.push(name);
                        state.num_processed += 1;
                        state.num_items += items;
                    }
                    Err(e) => {
                        let count = failures + 1;
                        error!(
                            action_id = %params.action_id,
                            kind = %params.kind,
                            tenant = %name,
                            attempt = count,
                            error = %e,
                            "sweep failed to update tenant"
                        );
                        state.failure_counts.insert(name, count);
                        if count < max_attempts {
                            again = true;
                        }
                    }
                }
            }
        }
        state.write_into(params)?;
        info!(
            action_id = %params.action_id,
            kind = %params.kind,
            processed = state.num_processed,
            items = state.num_items,
            skipped = state.failure_counts.len(),
            "sweep complete"
        );
        Ok(())
    }

    /// Upsert `tenant`'s snapshot for `season`, returning its model count.
    fn snapshot_tenant(&self, season: &str, tenant: &TenantRecord) -> CoordinatorResult<u64> {
        let models: Vec<ModelRecord> = self.store.find(
            &Query::kind(EntityKind::Model)
                .in_group(tenant.tenant_id.as_str())
                .filter_eq("delete_in_progress", false)
                .order_by("create_time"),
        )?;
        let snapshot = SeasonSnapshotRecord {
            season: season.to_string(),
            tenant_name: tenant.name.clone(),
            tenant_id: tenant.tenant_id.clone(),
            model_names: models.iter().map(|m| m.description.clone()).collect(),
            trained_checkpoints: models.iter().filter_map(|m| m.trained_checkpoint.clone()).collect(),
        };
        run_transaction(self.store.as_ref(), 1, |txn| txn.save(&snapshot))?;
        Ok(models.len() as u64)
    }
}

#[async_trait]
impl ActionHandler for AdminSweeps {
    async fn perform(&self, mut params: ActionParams, time_limit: DateTime<Utc>) -> CoordinatorResult<ActionParams> {
        match params.kind {
            ActionKind::ResetRemainingTrainingMinutes => {
                let minutes: i64 = params.field("reset_minutes")?;
                self.sweep(&mut params, time_limit, |t| t.remaining_training_minutes = minutes)?;
            }
            ActionKind::IncrementRemainingTrainingMinutes => {
                let minutes: i64 = params.field("increment_minutes")?;
                self.sweep(&mut params, time_limit, |t| t.remaining_training_minutes += minutes)?;
            }
            ActionKind::ResetTenants => {
                let initial = self.initial_training_minutes;
                self.sweep(&mut params, time_limit, |t| {
                    t.remaining_training_minutes = initial;
                    t.daily = DailyCounters::default();
                    t.videos_tracking_now.clear();
                    t.videos_deleted.clear();
                    t.datasets_deleted.clear();
                    t.models_deleted.clear();
                })?;
            }
            ActionKind::SaveSeasonSnapshot => {
                let season: String = params.field("season")?;
                self.sweep_each(&mut params, time_limit, |tenant| self.snapshot_tenant(&season, tenant))?;
            }
            other => {
                return Err(CoordinatorError::BadInput(format!(
                    "{other} is not an administrative sweep"
                )))
            }
        }
        Ok(params)
    }
}
