//! Action execution protocol.
//!
//! An action is a unit of asynchronous work identified by a kind and a
//! parameter bag. Triggering an action writes its params as a JSON blob into
//! the action-parameters bucket; the blob write fires an event that a worker
//! resolves back into params and dispatches to the matching handler.
//!
//! Lifecycle: `created` on trigger, `started` on every execution attempt,
//! `stopped` when an attempt abandons (retrigger or failure), `finished`
//! exactly once. Finished ordinary actions are deleted; finished
//! administrative actions are kept with their final params.
//!
//! Long-running bodies call [`ActionProtocol::retrigger_if_necessary`] at each
//! checkpoint. When the remaining time drops under the configured margin it
//! re-triggers the same params and returns [`CoordinatorError::Retriggered`],
//! which the body propagates to abandon the current execution.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::audit::{build_audit_event, AuditSink};
use super::error::{CoordinatorError, CoordinatorResult};
use crate::config::ActionConfig;
use crate::infra::blob::BlobStore;
use crate::infra::store::{
    run_transaction, Entity, EntityKey, EntityKind, EntityStore, Query, StoreExt, TransactionExt,
};
use crate::util::{ActionId, Clock, TenantId};

/// Entity group shared by all action records.
const ACTION_GROUP: &str = "actions";

/// Enumerated action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    /// Write one dataset record.
    ProduceDatasetRecord,
    /// Delete the shard-progress records of a finalized parent.
    DeleteShardProgress,
    /// Delete a dataset's records and blobs.
    DeleteDataset,
    /// Plan the partitions of a dataset archive.
    ZipDataset,
    /// Bundle one archive partition.
    ZipDatasetPartition,
    /// Poll the external scheduler for a model's jobs.
    MonitorTraining,
    /// Delete a model's blobs and record.
    DeleteModel,
    /// Delete a video's blobs and record.
    DeleteVideo,
    /// Delete a dataset archive's blobs and records.
    DeleteDatasetZip,
    /// Set every tenant's balance to a fixed value.
    ResetRemainingTrainingMinutes,
    /// Add minutes to every tenant's balance.
    IncrementRemainingTrainingMinutes,
    /// Return every tenant to its initial state.
    ResetTenants,
    /// Record every tenant's models for a season.
    SaveSeasonSnapshot,
}

impl ActionKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 13] = [
        Self::ProduceDatasetRecord,
        Self::DeleteShardProgress,
        Self::DeleteDataset,
        Self::ZipDataset,
        Self::ZipDatasetPartition,
        Self::MonitorTraining,
        Self::DeleteModel,
        Self::DeleteVideo,
        Self::DeleteDatasetZip,
        Self::ResetRemainingTrainingMinutes,
        Self::IncrementRemainingTrainingMinutes,
        Self::ResetTenants,
        Self::SaveSeasonSnapshot,
    ];

    /// Administrative actions sweep every tenant and are retained after finishing.
    #[must_use]
    pub const fn is_admin(self) -> bool {
        matches!(
            self,
            Self::ResetRemainingTrainingMinutes
                | Self::IncrementRemainingTrainingMinutes
                | Self::ResetTenants
                | Self::SaveSeasonSnapshot
        )
    }

    /// Stable name used in logs and persisted params.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProduceDatasetRecord => "PRODUCE_DATASET_RECORD",
            Self::DeleteShardProgress => "DELETE_SHARD_PROGRESS",
            Self::DeleteDataset => "DELETE_DATASET",
            Self::ZipDataset => "ZIP_DATASET",
            Self::ZipDatasetPartition => "ZIP_DATASET_PARTITION",
            Self::MonitorTraining => "MONITOR_TRAINING",
            Self::DeleteModel => "DELETE_MODEL",
            Self::DeleteVideo => "DELETE_VIDEO",
            Self::DeleteDatasetZip => "DELETE_DATASET_ZIP",
            Self::ResetRemainingTrainingMinutes => "RESET_REMAINING_TRAINING_MINUTES",
            Self::IncrementRemainingTrainingMinutes => "INCREMENT_REMAINING_TRAINING_MINUTES",
            Self::ResetTenants => "RESET_TENANTS",
            Self::SaveSeasonSnapshot => "SAVE_SEASON_SNAPSHOT",
        }
    }

    const fn entity_kind(self) -> EntityKind {
        if self.is_admin() {
            EntityKind::AdminAction
        } else {
            EntityKind::Action
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a recorded action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    /// Recorded, not yet picked up.
    Created,
    /// An execution attempt is running.
    Started,
    /// The last attempt abandoned; a retriggered attempt may follow.
    Stopped,
    /// Completed.
    Finished,
}

/// Resumable parameter bag passed by value into every execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionParams {
    /// Action id.
    pub action_id: ActionId,
    /// Action kind.
    pub kind: ActionKind,
    /// Owning tenant; `None` for administrative actions.
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    /// Kind-specific fields, including accumulated progress.
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl ActionParams {
    /// Whether the action is administrative.
    #[must_use]
    pub const fn is_admin(&self) -> bool {
        self.kind.is_admin()
    }

    /// Owning tenant.
    ///
    /// # Errors
    ///
    /// Returns `BadInput` for params without a tenant.
    pub fn tenant(&self) -> CoordinatorResult<&TenantId> {
        self.tenant_id.as_ref().ok_or_else(|| {
            CoordinatorError::BadInput(format!("action {} has no tenant", self.action_id))
        })
    }

    /// Decode a required field.
    ///
    /// # Errors
    ///
    /// Returns `BadInput` when the field is missing or has the wrong shape.
    pub fn field<T: DeserializeOwned>(&self, name: &str) -> CoordinatorResult<T> {
        let value = self.fields.get(name).ok_or_else(|| {
            CoordinatorError::BadInput(format!("action {} is missing '{name}'", self.action_id))
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            CoordinatorError::BadInput(format!("action {} field '{name}': {e}", self.action_id))
        })
    }

    /// Decode an optional field, falling back to `T::default()`.
    ///
    /// # Errors
    ///
    /// Returns `BadInput` when the field is present with the wrong shape.
    pub fn field_or_default<T: DeserializeOwned + Default>(&self, name: &str) -> CoordinatorResult<T> {
        if self.fields.contains_key(name) {
            self.field(name)
        } else {
            Ok(T::default())
        }
    }

    /// Store a field.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` when `value` cannot be encoded.
    pub fn set_field<T: Serialize>(&mut self, name: &str, value: T) -> CoordinatorResult<()> {
        self.fields.insert(name.to_string(), serde_json::to_value(value)?);
        Ok(())
    }
}

/// Persisted record of one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Action id.
    pub action_id: ActionId,
    /// Action kind.
    pub kind: ActionKind,
    /// Owning tenant; `None` for administrative actions.
    pub tenant_id: Option<TenantId>,
    /// Lifecycle state.
    pub state: ActionState,
    /// Creation time.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub create_time: DateTime<Utc>,
    /// Start of every execution attempt.
    #[serde(default)]
    pub start_times: Vec<DateTime<Utc>>,
    /// End of every abandoned or finished attempt.
    #[serde(default)]
    pub stop_times: Vec<DateTime<Utc>>,
    /// Final params, kept for administrative actions.
    #[serde(default)]
    pub params: Option<ActionParams>,
}

impl ActionRecord {
    /// Address of an action record.
    #[must_use]
    pub fn key_for(action_id: &ActionId, kind: ActionKind) -> EntityKey {
        EntityKey::new(kind.entity_kind(), ACTION_GROUP, action_id.as_str())
    }
}

impl Entity for ActionRecord {
    fn key(&self) -> EntityKey {
        Self::key_for(&self.action_id, self.kind)
    }
}

/// Records, triggers, and time-boxes actions.
pub struct ActionProtocol {
    store: Arc<dyn EntityStore>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    config: ActionConfig,
    audit: Option<Arc<Mutex<dyn AuditSink>>>,
}

impl ActionProtocol {
    /// Create the protocol over its collaborators.
    pub fn new(
        store: Arc<dyn EntityStore>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        config: ActionConfig,
    ) -> Self {
        Self {
            store,
            blobs,
            clock,
            config,
            audit: None,
        }
    }

    /// Record every lifecycle transition to `sink`.
    #[must_use]
    pub fn with_audit(mut self, sink: Arc<Mutex<dyn AuditSink>>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Action configuration.
    #[must_use]
    pub const fn config(&self) -> &ActionConfig {
        &self.config
    }

    /// Current time from the shared clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Deadline for an execution starting now.
    #[must_use]
    pub fn time_limit(&self) -> DateTime<Utc> {
        self.now() + self.config.execution_budget()
    }

    fn audit(&self, params: &ActionParams, transition: &str, detail: Option<String>) {
        if let Some(sink) = &self.audit {
            let tenant = params.tenant_id.as_ref().map(ToString::to_string).unwrap_or_default();
            sink.lock().record(build_audit_event(
                params.action_id.as_str(),
                params.kind.as_str(),
                tenant,
                transition,
                self.now(),
                detail,
            ));
        }
    }

    /// Record a new action in state `created` and return its empty params.
    ///
    /// # Errors
    ///
    /// Returns `BadInput` when an ordinary action has no tenant, or a store failure.
    pub fn create(&self, tenant_id: Option<&TenantId>, kind: ActionKind) -> CoordinatorResult<ActionParams> {
        if tenant_id.is_none() && !kind.is_admin() {
            return Err(CoordinatorError::BadInput(format!("{kind} requires a tenant")));
        }
        let params = ActionParams {
            action_id: ActionId::generate(),
            kind,
            tenant_id: tenant_id.cloned(),
            fields: Map::new(),
        };
        let record = ActionRecord {
            action_id: params.action_id.clone(),
            kind,
            tenant_id: params.tenant_id.clone(),
            state: ActionState::Created,
            create_time: self.now(),
            start_times: Vec::new(),
            stop_times: Vec::new(),
            params: None,
        };
        self.store.save(&record)?;
        debug!(action_id = %params.action_id, kind = %kind, "action created");
        self.audit(&params, "create", None);
        Ok(params)
    }

    /// Persist `params` into the action-parameters bucket, firing an
    /// execution. Returns the blob name.
    ///
    /// # Errors
    ///
    /// Propagates encoding or blob-write failures.
    pub fn trigger(&self, params: &ActionParams) -> CoordinatorResult<String> {
        let name = format!("{}.json", uuid::Uuid::new_v4().simple());
        let body = serde_json::to_vec(params)?;
        self.blobs
            .write(&self.config.parameters_bucket, &name, "application/json", body)?;
        info!(action_id = %params.action_id, kind = %params.kind, blob = %name, "action triggered");
        self.audit(params, "trigger", Some(name.clone()));
        Ok(name)
    }

    /// Create an action with `fields` (a JSON object) and trigger it.
    ///
    /// # Errors
    ///
    /// Returns `BadInput` when `fields` is not an object, or a store/blob failure.
    pub fn trigger_new(
        &self,
        tenant_id: Option<&TenantId>,
        kind: ActionKind,
        fields: Value,
    ) -> CoordinatorResult<ActionParams> {
        let Value::Object(fields) = fields else {
            return Err(CoordinatorError::BadInput(format!(
                "{kind} fields must be a JSON object"
            )));
        };
        let mut params = self.create(tenant_id, kind)?;
        params.fields = fields;
        self.trigger(&params)?;
        Ok(params)
    }

    /// Read and delete a parameters blob. `None` when the blob is gone, which
    /// happens when an event is delivered twice.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` for an unreadable blob, or a blob failure.
    pub fn take_params(&self, blob_name: &str) -> CoordinatorResult<Option<ActionParams>> {
        let bucket = &self.config.parameters_bucket;
        let Some(body) = self.blobs.read(bucket, blob_name)? else {
            return Ok(None);
        };
        self.blobs.delete(bucket, blob_name)?;
        Ok(Some(serde_json::from_slice(&body)?))
    }

    /// Mark an execution attempt as started. Safe to call once per attempt.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the action record no longer exists.
    pub fn on_start(&self, params: &ActionParams) -> CoordinatorResult<ActionRecord> {
        let now = self.now();
        let record = self.update_record(params, |record| {
            record.state = ActionState::Started;
            record.start_times.push(now);
        })?;
        info!(
            action_id = %params.action_id,
            kind = %params.kind,
            attempt = record.start_times.len(),
            "action started"
        );
        self.audit(params, "start", None);
        Ok(record)
    }

    /// Mark the current execution attempt as abandoned.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the action record no longer exists.
    pub fn on_stop(&self, params: &ActionParams) -> CoordinatorResult<ActionRecord> {
        let now = self.now();
        let record = self.update_record(params, |record| {
            record.state = ActionState::Stopped;
            record.stop_times.push(now);
        })?;
        info!(action_id = %params.action_id, kind = %params.kind, "action stopped");
        self.audit(params, "stop", None);
        Ok(record)
    }

    /// Finish the action: ordinary records are deleted, administrative
    /// records are kept with `params`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn on_finish(&self, params: &ActionParams) -> CoordinatorResult<()> {
        if params.is_admin() {
            let now = self.now();
            self.update_record(params, |record| {
                record.state = ActionState::Finished;
                record.stop_times.push(now);
                record.params = Some(params.clone());
            })?;
        } else {
            self.store
                .delete_multi(&[ActionRecord::key_for(&params.action_id, params.kind)])?;
        }
        info!(action_id = %params.action_id, kind = %params.kind, "action finished");
        self.audit(params, "finish", None);
        Ok(())
    }

    fn update_record(
        &self,
        params: &ActionParams,
        update: impl Fn(&mut ActionRecord),
    ) -> CoordinatorResult<ActionRecord> {
        let key = ActionRecord::key_for(&params.action_id, params.kind);
        run_transaction(self.store.as_ref(), self.config.transaction_attempts, |txn| {
            let mut record: ActionRecord = txn
                .load(&key)?
                .ok_or_else(|| CoordinatorError::NotFound(format!("action {}", params.action_id)))?;
            update(&mut record);
            txn.save(&record)?;
            Ok(record)
        })
    }

    /// Checkpoint for long-running bodies. When less than the retrigger margin
    /// remains before `time_limit`, re-triggers `params` and returns
    /// `Retriggered`; otherwise returns `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns `Retriggered` after re-queuing, or a blob failure.
    pub fn retrigger_if_necessary(&self, params: &ActionParams, time_limit: DateTime<Utc>) -> CoordinatorResult<()> {
        if time_limit - self.now() >= self.config.retrigger_margin() {
            return Ok(());
        }
        self.trigger(params)?;
        warn!(action_id = %params.action_id, kind = %params.kind, "action retriggered near its time limit");
        self.audit(params, "retrigger", None);
        Err(CoordinatorError::Retriggered {
            action_id: params.action_id.to_string(),
        })
    }

    /// Load one action record.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn action(&self, action_id: &ActionId, kind: ActionKind) -> CoordinatorResult<Option<ActionRecord>> {
        self.store.load(&ActionRecord::key_for(action_id, kind))
    }

    /// Recorded actions, optionally restricted to a tenant and kind, ordered
    /// by creation time.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn list_actions(
        &self,
        tenant_id: Option<&TenantId>,
        kind: Option<ActionKind>,
    ) -> CoordinatorResult<Vec<ActionRecord>> {
        let entity_kinds: &[EntityKind] = match kind {
            Some(k) => &[k.entity_kind()],
            None => &[EntityKind::Action, EntityKind::AdminAction],
        };
        let mut records = Vec::new();
        for entity_kind in entity_kinds {
            let mut query = Query::kind(*entity_kind)
                .in_group(ACTION_GROUP)
                .order_by("create_time");
            if let Some(tenant_id) = tenant_id {
                query = query.filter_eq("tenant_id", tenant_id);
            }
            if let Some(kind) = kind {
                query = query.filter_eq("kind", kind);
            }
            records.extend(self.store.find::<ActionRecord>(&query)?);
        }
        records.sort_by(|a, b| {
            a.create_time
                .cmp(&b.create_time)
                .then_with(|| a.action_id.cmp(&b.action_id))
        });
        Ok(records)
    }

    /// Delete one action record.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn remove_action(&self, record: &ActionRecord) -> CoordinatorResult<()> {
        self.store.delete_multi(&[record.key()])?;
        debug!(action_id = %record.action_id, kind = %record.kind, "action removed");
        Ok(())
    }
}
