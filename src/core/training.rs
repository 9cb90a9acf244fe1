//! Training job lifecycle.
//!
//! A model owns one training sub-job and an optional evaluation sub-job on the
//! external scheduler. Starting reserves the requested minutes up front; any
//! submission failure compensates by cancelling what was already submitted,
//! deleting the model folder, and releasing the reservation. A separately
//! triggered `MonitorTraining` action mirrors the scheduler's job states onto
//! the model and settles the reservation once, the first time the training
//! sub-job's end time is observed.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::action::{ActionKind, ActionParams, ActionProtocol};
use super::aggregator::merge_label_counts;
use super::dataset::{describe_models, DatasetRecord, EVAL_GROUP, TRAIN_GROUP};
use super::entities::{push_unique, TenantRecord};
use super::error::{CoordinatorError, CoordinatorResult};
use super::executor::ActionHandler;
use super::quota::{QuotaLedger, Settlement};
use crate::config::TrainingConfig;
use crate::infra::blob::{delete_prefix, BlobStore};
use crate::infra::scheduler::{ExternalJob, ExternalJobState, JobScheduler, JobSpec, ScaleTier};
use crate::infra::store::{
    run_transaction, Entity, EntityKey, EntityKind, EntityStore, Query, StoreExt, TransactionExt,
};
use crate::util::{Clock, DatasetId, ModelId, TenantId};

/// Built-in starting model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartingModel {
    /// Catalog name.
    pub name: &'static str,
    /// Batch size on an accelerator worker.
    pub accelerator_batch_size: u32,
    /// Batch size on a GPU worker.
    pub gpu_batch_size: u32,
    /// Learning-rate warmup steps.
    pub warmup_steps: u32,
}

/// Built-in starting models.
pub const STARTING_MODELS: [StartingModel; 4] = [
    StartingModel {
        name: "SSD MobileNet v2 320x320",
        accelerator_batch_size: 512,
        gpu_batch_size: 32,
        warmup_steps: 2000,
    },
    StartingModel {
        name: "SSD MobileNet V2 FPNLite 320x320",
        accelerator_batch_size: 128,
        gpu_batch_size: 32,
        warmup_steps: 1000,
    },
    StartingModel {
        name: "SSD MobileNet V1 FPN 640x640",
        accelerator_batch_size: 64,
        gpu_batch_size: 16,
        warmup_steps: 2000,
    },
    StartingModel {
        name: "SSD MobileNet V2 FPNLite 640x640",
        accelerator_batch_size: 128,
        gpu_batch_size: 16,
        warmup_steps: 1000,
    },
];

/// Look up a built-in starting model by name.
#[must_use]
pub fn starting_model(name: &str) -> Option<&'static StartingModel> {
    STARTING_MODELS.iter().find(|m| m.name == name)
}

impl StartingModel {
    /// Batch size for `train_frame_count` frames: the catalog size, halved
    /// while it exceeds the frame count and is at least 2.
    #[must_use]
    pub const fn batch_size(&self, use_accelerator: bool, train_frame_count: u64) -> u32 {
        let mut batch = if use_accelerator {
            self.accelerator_batch_size
        } else {
            self.gpu_batch_size
        };
        while batch as u64 > train_frame_count && batch >= 2 {
            batch /= 2;
        }
        batch
    }

    /// Warmup steps, never more than the training steps.
    #[must_use]
    pub fn warmup_steps(&self, num_training_steps: u32) -> u32 {
        self.warmup_steps.min(num_training_steps)
    }
}

/// Allowed training steps for a hardware tier.
#[must_use]
pub const fn training_step_range(use_accelerator: bool) -> (u32, u32) {
    if use_accelerator {
        (100, 4000)
    } else {
        (200, 8000)
    }
}

/// Which sub-job of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRole {
    /// Primary training job.
    Train,
    /// Evaluation job.
    Eval,
}

impl JobRole {
    /// Scheduler job id for `model_id`.
    #[must_use]
    pub fn job_id(self, model_id: &ModelId) -> String {
        match self {
            Self::Train => format!("train_{model_id}"),
            Self::Eval => format!("eval_{model_id}"),
        }
    }
}

/// Local mirror of one external sub-job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubJob {
    /// Scheduler job id.
    pub job_id: String,
    /// Last observed state.
    pub state: ExternalJobState,
    /// When the scheduler accepted the job.
    pub create_time: Option<DateTime<Utc>>,
    /// When the job began executing.
    pub start_time: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub end_time: Option<DateTime<Utc>>,
    /// Execution time, known once both start and end are.
    pub elapsed_secs: Option<i64>,
    /// Consumed resource units.
    pub consumed_units: f64,
    /// Error text, truncated for storage.
    pub error_message: String,
    /// Refund marker for this job's reservation.
    #[serde(default)]
    pub settlement: Settlement,
}

impl SubJob {
    fn from_submission(job: &ExternalJob) -> Self {
        Self {
            job_id: job.job_id.clone(),
            state: job.state,
            create_time: job.create_time,
            start_time: job.start_time,
            end_time: job.end_time,
            elapsed_secs: None,
            consumed_units: job.consumed_units,
            error_message: String::new(),
            settlement: Settlement::default(),
        }
    }

    /// Copy the scheduler's view of the job, keeping the settlement marker.
    pub fn apply(&mut self, job: &ExternalJob, max_error_len: usize) {
        self.state = job.state;
        self.consumed_units = job.consumed_units;
        if job.create_time.is_some() {
            self.create_time = job.create_time;
        }
        if job.start_time.is_some() {
            self.start_time = job.start_time;
        }
        if job.end_time.is_some() {
            self.end_time = job.end_time;
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            self.elapsed_secs = Some((end - start).num_seconds().max(0));
        }
        self.error_message = truncate_error_message(&job.error_message, max_error_len);
    }
}

/// Shorten `message` to `max_len` characters, ending in `..` when cut.
#[must_use]
pub fn truncate_error_message(message: &str, max_len: usize) -> String {
    if message.chars().count() <= max_len {
        return message.to_string();
    }
    let mut cut: String = message.chars().take(max_len.saturating_sub(2)).collect();
    cut.push_str("..");
    cut
}

/// How a training job's error message is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Expected: the job hit its time limit or was cancelled.
    Benign,
    /// The job ran out of memory.
    OutOfMemory,
    /// Anything else.
    Critical,
}

/// Classify a training job's error message.
#[must_use]
pub fn classify_error(message: &str) -> ErrorClass {
    if message.contains("Job was cancelled for exceeding the maximum allowed duration of")
        || message.contains("Job is cancelled by the user")
    {
        ErrorClass::Benign
    } else if message.contains("OOM when allocating tensor") || message.contains("out-of-memory") {
        ErrorClass::OutOfMemory
    } else {
        ErrorClass::Critical
    }
}

/// Monitor bookkeeping used by the restart rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorState {
    /// Last time a monitor was triggered.
    pub triggered_time: Option<DateTime<Utc>>,
    /// Last time a monitor made progress.
    pub active_time: Option<DateTime<Utc>>,
    /// The monitor finished; it never restarts.
    pub finished: bool,
}

impl MonitorState {
    /// Whether a fresh monitor should be triggered at `now`.
    #[must_use]
    pub fn needs_restart(&self, now: DateTime<Utc>, restart_after: chrono::TimeDelta) -> bool {
        if self.finished {
            return false;
        }
        let Some(triggered) = self.triggered_time else {
            return false;
        };
        match self.active_time {
            Some(active) if active > triggered => now - active > restart_after,
            _ => now - triggered > restart_after,
        }
    }
}

/// Training settings written to the model folder before submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Built-in ancestor.
    pub original_starting_model: String,
    /// Checkpoint training resumes from, when derived from another model.
    pub fine_tune_checkpoint: Option<String>,
    /// Label map blob.
    pub label_map_path: String,
    /// Number of labels.
    pub num_classes: u32,
    /// Evaluation examples.
    pub num_examples: u64,
    /// Total training steps.
    pub num_training_steps: u32,
    /// Evaluation images kept for visualization.
    pub num_visualizations: u64,
    /// Training batch size.
    pub train_batch_size: u32,
    /// Learning-rate warmup steps.
    pub num_warmup_steps: u32,
    /// Training record folders.
    pub train_input_path: Vec<String>,
    /// Evaluation record folders.
    pub eval_input_path: Vec<String>,
}

/// Arguments of a training request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTrainingRequest {
    /// Model description.
    pub description: String,
    /// Datasets to train on.
    pub dataset_ids: Vec<DatasetId>,
    /// Catalog name, or the id of a trained model to continue from.
    pub starting_model: String,
    /// Minutes reserved from the tenant's balance.
    pub max_running_minutes: i64,
    /// Training steps.
    pub num_training_steps: u32,
    /// Train on an accelerator worker instead of a GPU.
    pub use_accelerator: bool,
}

/// A trained (or training) model and its sub-jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Model id.
    pub model_id: ModelId,
    /// Caller-supplied description.
    pub description: String,
    /// Datasets trained on, including the starting model's.
    pub dataset_ids: Vec<DatasetId>,
    /// As requested: a catalog name or a model id.
    pub starting_model: String,
    /// Built-in ancestor.
    pub original_starting_model: String,
    /// Checkpoint training resumed from.
    pub fine_tune_checkpoint: Option<String>,
    /// Hardware tier.
    pub use_accelerator: bool,
    /// Minutes reserved for the training sub-job.
    pub reserved_minutes: i64,
    /// Training steps of this run.
    pub num_training_steps: u32,
    /// Steps trained by the starting model chain.
    pub previous_training_steps: u32,
    /// Batch size.
    pub batch_size: u32,
    /// Warmup steps.
    pub num_warmup_steps: u32,
    /// Labels in label-map order.
    pub sorted_label_list: Vec<String>,
    /// Training frames.
    pub train_frame_count: u64,
    /// Evaluation frames.
    pub eval_frame_count: u64,
    /// Training frames without labels.
    #[serde(default)]
    pub train_negative_frame_count: u64,
    /// Evaluation frames without labels.
    #[serde(default)]
    pub eval_negative_frame_count: u64,
    /// Boxes per label in the training frames.
    #[serde(default)]
    pub train_label_counts: BTreeMap<String, u64>,
    /// Boxes per label in the evaluation frames.
    #[serde(default)]
    pub eval_label_counts: BTreeMap<String, u64>,
    /// Training record folders, including the starting model's.
    #[serde(default)]
    pub train_input_path: Vec<String>,
    /// Evaluation record folders, including the starting model's.
    #[serde(default)]
    pub eval_input_path: Vec<String>,
    /// Folder holding the model's blobs.
    pub model_folder: String,
    /// Training sub-job.
    pub train: SubJob,
    /// Evaluation sub-job, absent when there are no evaluation frames.
    pub eval: Option<SubJob>,
    /// Latest checkpoint written by training.
    #[serde(default)]
    pub trained_checkpoint: Option<String>,
    /// Monitor bookkeeping.
    #[serde(default)]
    pub monitor: MonitorState,
    /// A stop was requested.
    #[serde(default)]
    pub cancel_requested: bool,
    /// Deletion has been requested.
    #[serde(default)]
    pub delete_in_progress: bool,
    /// Creation time.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub create_time: DateTime<Utc>,
    /// Last job-state update.
    pub update_time: DateTime<Utc>,
}

impl ModelRecord {
    /// Address of a model.
    #[must_use]
    pub fn key_for(tenant_id: &TenantId, model_id: &ModelId) -> EntityKey {
        EntityKey::new(EntityKind::Model, tenant_id.as_str(), model_id.as_str())
    }

    /// Folder holding a model's blobs.
    #[must_use]
    pub fn folder(tenant_id: &TenantId, model_id: &ModelId) -> String {
        format!("models/{tenant_id}/{model_id}/")
    }

    /// Whether any sub-job may still consume resources.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.train.state.is_alive() || self.eval.as_ref().is_some_and(|e| e.state.is_alive())
    }

    fn jobs_done(&self) -> bool {
        self.train.state.is_terminal() && self.eval.as_ref().is_none_or(|e| e.state.is_terminal())
    }
}

impl Entity for ModelRecord {
    fn key(&self) -> EntityKey {
        Self::key_for(&self.tenant_id, &self.model_id)
    }
}

/// Latest `ckpt-N.index` blob in a model folder.
fn latest_checkpoint(names: &[String]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| {
            let file = name.rsplit('/').next()?;
            let step: u64 = file.strip_prefix("ckpt-")?.strip_suffix(".index")?.parse().ok()?;
            Some((step, name.trim_end_matches(".index").to_string()))
        })
        .max_by_key(|(step, _)| *step)
        .map(|(_, path)| path)
}

struct ResolvedStart {
    catalog: &'static StartingModel,
    parent: Option<ModelRecord>,
}

/// Drives models through submission, monitoring, and deletion.
pub struct TrainingLifecycle {
    store: Arc<dyn EntityStore>,
    blobs: Arc<dyn BlobStore>,
    scheduler: Arc<dyn JobScheduler>,
    clock: Arc<dyn Clock>,
    actions: Arc<ActionProtocol>,
    ledger: Arc<QuotaLedger>,
    config: TrainingConfig,
}

impl TrainingLifecycle {
    /// Create the lifecycle.
    pub fn new(
        store: Arc<dyn EntityStore>,
        blobs: Arc<dyn BlobStore>,
        scheduler: Arc<dyn JobScheduler>,
        clock: Arc<dyn Clock>,
        actions: Arc<ActionProtocol>,
        ledger: Arc<QuotaLedger>,
        config: TrainingConfig,
    ) -> Self {
        Self {
            store,
            blobs,
            scheduler,
            clock,
            actions,
            ledger,
            config,
        }
    }

    fn bucket(&self) -> &str {
        &self.actions.config().artifacts_bucket
    }

    fn attempts(&self) -> u32 {
        self.actions.config().transaction_attempts
    }

    /// One model.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing model.
    pub fn model(&self, tenant_id: &TenantId, model_id: &ModelId) -> CoordinatorResult<ModelRecord> {
        self.store
            .load::<ModelRecord>(&ModelRecord::key_for(tenant_id, model_id))?
            .ok_or_else(|| CoordinatorError::NotFound(format!("model {model_id}")))
    }

    /// The tenant's models, oldest first, without those being deleted.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn models(&self, tenant_id: &TenantId) -> CoordinatorResult<Vec<ModelRecord>> {
        let query = Query::kind(EntityKind::Model)
            .in_group(tenant_id.as_str())
            .filter_eq("delete_in_progress", false)
            .order_by("create_time");
        self.store.find(&query)
    }

    /// Resolve a starting model to its built-in ancestor, walking derived
    /// models one parent at a time.
    ///
    /// # Errors
    ///
    /// Returns `BadInput` for a malformed id or a cycle, `NotFound` for a
    /// missing ancestor or a derived model without a trained checkpoint.
    fn resolve_starting_model(&self, tenant_id: &TenantId, requested: &str) -> CoordinatorResult<ResolvedStart> {
        if let Some(catalog) = starting_model(requested) {
            return Ok(ResolvedStart {
                catalog,
                parent: None,
            });
        }
        let parent_id = ModelId::parse(requested)?;
        let parent = self.model(tenant_id, &parent_id)?;
        if parent.trained_checkpoint.is_none() {
            return Err(CoordinatorError::NotFound(format!(
                "trained checkpoint for model {parent_id}"
            )));
        }
        let mut visited = HashSet::from([parent_id.clone()]);
        let mut current = parent.starting_model.clone();
        loop {
            if let Some(catalog) = starting_model(&current) {
                return Ok(ResolvedStart {
                    catalog,
                    parent: Some(parent),
                });
            }
            let id = ModelId::parse(&current)?;
            if !visited.insert(id.clone()) {
                return Err(CoordinatorError::BadInput(format!(
                    "starting model chain of {parent_id} loops at {id}"
                )));
            }
            current = self.model(tenant_id, &id)?.starting_model;
        }
    }

    /// Reserve minutes, write the pipeline config, and submit the sub-jobs.
    /// The evaluation job is submitted first. Any failure after the
    /// reservation cancels what was submitted, deletes the model folder, and
    /// releases the reservation.
    ///
    /// # Errors
    ///
    /// Returns `BadInput`, `NotFound`, `QuotaExceeded`, or the scheduler's
    /// `ExternalService` failure.
    pub async fn start_training(&self, tenant_id: &TenantId, request: StartTrainingRequest) -> CoordinatorResult<ModelRecord> {
        let (min_steps, max_steps) = training_step_range(request.use_accelerator);
        if !(min_steps..=max_steps).contains(&request.num_training_steps) {
            return Err(CoordinatorError::BadInput(format!(
                "num_training_steps must be within {min_steps}..={max_steps}"
            )));
        }
        if request.dataset_ids.is_empty() {
            return Err(CoordinatorError::BadInput("at least one dataset is required".into()));
        }
        let resolved = self.resolve_starting_model(tenant_id, &request.starting_model)?;

        let mut dataset_ids = Vec::new();
        let mut train_input_path = Vec::new();
        let mut eval_input_path = Vec::new();
        let mut train_frame_count = 0;
        let mut eval_frame_count = 0;
        let mut train_negative_frame_count = 0;
        let mut eval_negative_frame_count = 0;
        let mut train_label_counts = BTreeMap::new();
        let mut eval_label_counts = BTreeMap::new();
        let mut previous_training_steps = 0;
        let mut labels: Option<(Vec<String>, String)> = None;
        if let Some(parent) = &resolved.parent {
            dataset_ids.extend(parent.dataset_ids.iter().cloned());
            train_input_path.extend(parent.train_input_path.iter().cloned());
            eval_input_path.extend(parent.eval_input_path.iter().cloned());
            train_frame_count += parent.train_frame_count;
            eval_frame_count += parent.eval_frame_count;
            train_negative_frame_count += parent.train_negative_frame_count;
            eval_negative_frame_count += parent.eval_negative_frame_count;
            merge_label_counts(&mut train_label_counts, &parent.train_label_counts);
            merge_label_counts(&mut eval_label_counts, &parent.eval_label_counts);
            previous_training_steps = parent.previous_training_steps + parent.num_training_steps;
        }
        for dataset_id in &request.dataset_ids {
            let dataset: DatasetRecord = self
                .store
                .load::<DatasetRecord>(&DatasetRecord::key_for(tenant_id, dataset_id))?
                .filter(|d| !d.delete_in_progress)
                .ok_or_else(|| CoordinatorError::NotFound(format!("dataset {dataset_id}")))?;
            if !dataset.dataset_completed {
                return Err(CoordinatorError::BadInput(format!(
                    "dataset {dataset_id} is not complete"
                )));
            }
            match &labels {
                None => {
                    labels = Some((
                        dataset.sorted_label_list.clone(),
                        dataset.label_map_blob_name.clone().unwrap_or_default(),
                    ));
                }
                Some((list, _)) if *list != dataset.sorted_label_list => {
                    return Err(CoordinatorError::BadInput(
                        "the datasets contain different labels and cannot be used together".into(),
                    ));
                }
                Some(_) => {}
            }
            let folder = DatasetRecord::folder(tenant_id, dataset_id);
            train_input_path.push(format!("{folder}{TRAIN_GROUP}/"));
            eval_input_path.push(format!("{folder}{EVAL_GROUP}/"));
            train_frame_count += dataset.train_frame_count;
            eval_frame_count += dataset.eval_frame_count;
            train_negative_frame_count += dataset.train.negative_count;
            eval_negative_frame_count += dataset.eval.negative_count;
            merge_label_counts(&mut train_label_counts, &dataset.train.label_counts);
            merge_label_counts(&mut eval_label_counts, &dataset.eval.label_counts);
            push_unique(&mut dataset_ids, dataset_id.clone());
        }
        let (sorted_label_list, label_map_path) = labels.unwrap_or_default();
        if let Some(parent) = &resolved.parent {
            if parent.sorted_label_list != sorted_label_list {
                return Err(CoordinatorError::BadInput(
                    "the datasets' labels differ from the starting model's".into(),
                ));
            }
        }

        let catalog = resolved.catalog;
        let batch_size = catalog.batch_size(request.use_accelerator, train_frame_count);
        let num_warmup_steps = catalog.warmup_steps(request.num_training_steps);
        let fine_tune_checkpoint = resolved.parent.as_ref().and_then(|p| p.trained_checkpoint.clone());
        let pipeline = PipelineConfig {
            original_starting_model: catalog.name.to_string(),
            fine_tune_checkpoint: fine_tune_checkpoint.clone(),
            label_map_path,
            num_classes: u32::try_from(sorted_label_list.len()).unwrap_or(u32::MAX),
            num_examples: eval_frame_count,
            num_training_steps: request.num_training_steps,
            num_visualizations: eval_frame_count.min(100),
            train_batch_size: batch_size,
            num_warmup_steps,
            train_input_path: train_input_path.clone(),
            eval_input_path: eval_input_path.clone(),
        };

        self.ledger.reserve(tenant_id, request.max_running_minutes)?;
        let model_id = ModelId::generate();
        let model_folder = ModelRecord::folder(tenant_id, &model_id);
        let submitted = self
            .submit_jobs(&model_id, &model_folder, &pipeline, &request, eval_frame_count > 0)
            .await;
        let (train_job, eval_job) = match submitted {
            Ok(jobs) => jobs,
            Err(e) => {
                self.compensate_failed_start(tenant_id, &model_folder, request.max_running_minutes);
                return Err(e);
            }
        };

        let now = self.clock.now();
        let model = ModelRecord {
            tenant_id: tenant_id.clone(),
            model_id: model_id.clone(),
            description: request.description,
            dataset_ids,
            starting_model: request.starting_model,
            original_starting_model: catalog.name.to_string(),
            fine_tune_checkpoint,
            use_accelerator: request.use_accelerator,
            reserved_minutes: request.max_running_minutes,
            num_training_steps: request.num_training_steps,
            previous_training_steps,
            batch_size,
            num_warmup_steps,
            sorted_label_list,
            train_frame_count,
            eval_frame_count,
            train_negative_frame_count,
            eval_negative_frame_count,
            train_label_counts,
            eval_label_counts,
            train_input_path,
            eval_input_path,
            model_folder,
            train: SubJob::from_submission(&train_job),
            eval: eval_job.as_ref().map(SubJob::from_submission),
            trained_checkpoint: None,
            monitor: MonitorState::default(),
            cancel_requested: false,
            delete_in_progress: false,
            create_time: now,
            update_time: now,
        };
        self.store.save(&model)?;
        info!(tenant = %tenant_id, model = %model_id, batch_size, "training started");
        self.start_monitor(tenant_id, &model_id)
    }

    async fn submit_jobs(
        &self,
        model_id: &ModelId,
        model_folder: &str,
        pipeline: &PipelineConfig,
        request: &StartTrainingRequest,
        with_eval: bool,
    ) -> CoordinatorResult<(ExternalJob, Option<ExternalJob>)> {
        let pipeline_path = format!("{model_folder}pipeline.json");
        self.blobs.write(
            self.bucket(),
            &pipeline_path,
            "application/json",
            serde_json::to_vec_pretty(pipeline)?,
        )?;

        let eval_job = if with_eval {
            let spec = JobSpec {
                job_id: JobRole::Eval.job_id(model_id),
                scale_tier: ScaleTier::Gpu,
                job_dir: model_folder.to_string(),
                args: vec![
                    "--model_dir".into(),
                    model_folder.to_string(),
                    "--pipeline_config_path".into(),
                    pipeline_path.clone(),
                    "--checkpoint_dir".into(),
                    model_folder.to_string(),
                ],
                max_running_secs: None,
            };
            match self.scheduler.submit(spec).await {
                Ok(job) => Some(job),
                Err(e) => {
                    error!(model = %model_id, error = %e, "failed to submit evaluation job");
                    return Err(e);
                }
            }
        } else {
            None
        };

        let mut args = vec![
            "--model_dir".to_string(),
            model_folder.to_string(),
            "--pipeline_config_path".into(),
            pipeline_path,
            "--checkpoint_every_n".into(),
            self.config.checkpoint_every_n.to_string(),
        ];
        if request.use_accelerator {
            args.extend(["--use_tpu".to_string(), "true".to_string()]);
        }
        let spec = JobSpec {
            job_id: JobRole::Train.job_id(model_id),
            scale_tier: if request.use_accelerator {
                ScaleTier::Accelerator
            } else {
                ScaleTier::Gpu
            },
            job_dir: model_folder.to_string(),
            args,
            max_running_secs: u64::try_from(request.max_running_minutes).ok().map(|m| m * 60),
        };
        match self.scheduler.submit(spec).await {
            Ok(job) => Ok((job, eval_job)),
            Err(e) => {
                error!(model = %model_id, error = %e, "failed to submit training job");
                if let Some(eval) = &eval_job {
                    if let Err(cancel_err) = self.scheduler.cancel(&eval.job_id).await {
                        warn!(job = %eval.job_id, error = %cancel_err, "failed to cancel evaluation job");
                    }
                }
                Err(e)
            }
        }
    }

    fn compensate_failed_start(&self, tenant_id: &TenantId, model_folder: &str, minutes: i64) {
        if let Err(e) = self.ledger.release(tenant_id, minutes) {
            error!(tenant = %tenant_id, minutes, error = %e, "failed to release reservation");
        }
        if let Err(e) = delete_prefix(self.blobs.as_ref(), self.bucket(), model_folder) {
            warn!(tenant = %tenant_id, folder = model_folder, error = %e, "failed to delete model folder");
        }
    }

    /// Cancel alive sub-jobs, best effort, and record the request.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing model.
    pub async fn stop_training(&self, tenant_id: &TenantId, model_id: &ModelId) -> CoordinatorResult<ModelRecord> {
        let model = self.model(tenant_id, model_id)?;
        let alive = std::iter::once(&model.train)
            .chain(model.eval.as_ref())
            .filter(|job| job.state.is_alive());
        for job in alive {
            if let Err(e) = self.scheduler.cancel(&job.job_id).await {
                warn!(job = %job.job_id, error = %e, "failed to cancel job");
            }
        }
        let key = model.key();
        run_transaction(self.store.as_ref(), self.attempts(), |txn| {
            let mut model: ModelRecord = txn
                .load(&key)?
                .ok_or_else(|| CoordinatorError::NotFound(format!("model {model_id}")))?;
            model.cancel_requested = true;
            txn.save(&model)?;
            Ok(model)
        })
    }

    /// Mirror the scheduler's view of the sub-jobs onto the model. The first
    /// time the training job's end time is seen, the reservation is settled
    /// in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing model or tenant.
    pub fn update_job_state(
        &self,
        tenant_id: &TenantId,
        model_id: &ModelId,
        train_job: &ExternalJob,
        eval_job: Option<&ExternalJob>,
    ) -> CoordinatorResult<ModelRecord> {
        let folder = ModelRecord::folder(tenant_id, model_id);
        let trained_checkpoint = latest_checkpoint(&self.blobs.list(self.bucket(), &folder)?);
        let now = self.clock.now();
        let key = ModelRecord::key_for(tenant_id, model_id);
        let max_len = self.config.max_error_message_len;
        let mut previous_error = String::new();
        let mut refunded = None;
        let model = run_transaction(self.store.as_ref(), self.attempts(), |txn| {
            let mut model: ModelRecord = txn
                .load(&key)?
                .ok_or_else(|| CoordinatorError::NotFound(format!("model {model_id}")))?;
            previous_error.clone_from(&model.train.error_message);
            model.train.apply(train_job, max_len);
            refunded = None;
            if model.train.end_time.is_some() {
                let elapsed = model.train.elapsed_secs.unwrap_or(0);
                refunded = QuotaLedger::settle_in(
                    txn,
                    tenant_id,
                    &mut model.train.settlement,
                    model.reserved_minutes,
                    elapsed,
                    model.train.state,
                    now,
                )?;
            }
            if let (Some(eval), Some(job)) = (model.eval.as_mut(), eval_job) {
                eval.apply(job, max_len);
            }
            if trained_checkpoint.is_some() {
                model.trained_checkpoint.clone_from(&trained_checkpoint);
            }
            model.update_time = now;
            txn.save(&model)?;
            Ok(model)
        })?;
        if let Some(minutes) = refunded {
            info!(tenant = %tenant_id, model = %model_id, refund = minutes, "training reservation settled");
        }
        if !model.train.error_message.is_empty() && model.train.error_message != previous_error {
            log_job_error(&model);
        }
        Ok(model)
    }

    /// Stamp the monitor's trigger time.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing model.
    pub fn prepare_to_start_monitor(&self, tenant_id: &TenantId, model_id: &ModelId) -> CoordinatorResult<ModelRecord> {
        let now = self.clock.now();
        self.update_monitor(tenant_id, model_id, |m| m.triggered_time = Some(now))
    }

    fn start_monitor(&self, tenant_id: &TenantId, model_id: &ModelId) -> CoordinatorResult<ModelRecord> {
        let model = self.prepare_to_start_monitor(tenant_id, model_id)?;
        self.actions.trigger_new(
            Some(tenant_id),
            ActionKind::MonitorTraining,
            json!({ "model_id": model_id }),
        )?;
        Ok(model)
    }

    /// Trigger a fresh monitor when the last one never became active, or went
    /// quiet, for longer than the restart threshold. Returns whether a
    /// monitor was triggered.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing model.
    pub fn maybe_restart_monitor(&self, tenant_id: &TenantId, model_id: &ModelId) -> CoordinatorResult<bool> {
        let model = self.model(tenant_id, model_id)?;
        if !model
            .monitor
            .needs_restart(self.clock.now(), self.config.monitor_restart())
        {
            return Ok(false);
        }
        warn!(tenant = %tenant_id, model = %model_id, "restarting training monitor");
        self.start_monitor(tenant_id, model_id)?;
        Ok(true)
    }

    fn update_monitor(
        &self,
        tenant_id: &TenantId,
        model_id: &ModelId,
        update: impl Fn(&mut MonitorState),
    ) -> CoordinatorResult<ModelRecord> {
        let key = ModelRecord::key_for(tenant_id, model_id);
        run_transaction(self.store.as_ref(), self.attempts(), |txn| {
            let mut model: ModelRecord = txn
                .load(&key)?
                .ok_or_else(|| CoordinatorError::NotFound(format!("model {model_id}")))?;
            update(&mut model.monitor);
            txn.save(&model)?;
            Ok(model)
        })
    }

    async fn poll_jobs(&self, model: &ModelRecord) -> CoordinatorResult<(ExternalJob, Option<ExternalJob>)> {
        let train = self.scheduler.get(&model.train.job_id).await?;
        let eval = match &model.eval {
            Some(eval) => Some(self.scheduler.get(&eval.job_id).await?),
            None => None,
        };
        Ok((train, eval))
    }

    async fn monitor_training(&self, params: ActionParams, time_limit: DateTime<Utc>) -> CoordinatorResult<ActionParams> {
        let tenant_id = params.tenant()?.clone();
        let model_id: ModelId = params.field("model_id")?;
        loop {
            self.actions.retrigger_if_necessary(&params, time_limit)?;
            let now = self.clock.now();
            let model = match self.update_monitor(&tenant_id, &model_id, |m| m.active_time = Some(now)) {
                Ok(model) => model,
                Err(CoordinatorError::NotFound(_)) => {
                    debug!(tenant = %tenant_id, model = %model_id, "model gone, monitor exits");
                    return Ok(params);
                }
                Err(e) => return Err(e),
            };
            if model.monitor.finished || model.delete_in_progress {
                return Ok(params);
            }
            match self.poll_jobs(&model).await {
                Ok((train, eval)) => {
                    let model = self.update_job_state(&tenant_id, &model_id, &train, eval.as_ref())?;
                    if model.train.state.is_terminal() {
                        if let Some(eval) = model.eval.as_ref().filter(|e| e.state.is_alive()) {
                            if let Err(e) = self.scheduler.cancel(&eval.job_id).await {
                                warn!(job = %eval.job_id, error = %e, "failed to cancel evaluation job");
                            }
                        }
                    }
                    if model.jobs_done() {
                        let now = self.clock.now();
                        self.update_monitor(&tenant_id, &model_id, |m| {
                            m.finished = true;
                            m.active_time = Some(now);
                        })?;
                        info!(tenant = %tenant_id, model = %model_id, state = ?model.train.state, "training monitor finished");
                        return Ok(params);
                    }
                }
                Err(e) => {
                    warn!(tenant = %tenant_id, model = %model_id, error = %e, "failed to poll training jobs");
                }
            }
            tokio::time::sleep(self.config.monitor_poll()).await;
        }
    }

    /// Whether none of `model_ids` is the starting model of another model.
    /// Returns one message per blocked model.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when a requested model does not exist.
    pub fn can_delete_models(&self, tenant_id: &TenantId, model_ids: &[ModelId]) -> CoordinatorResult<(bool, Vec<String>)> {
        let models: Vec<ModelRecord> =
            self.store.find(&Query::kind(EntityKind::Model).in_group(tenant_id.as_str()))?;
        let mut messages = Vec::new();
        for requested in model_ids {
            let model = models
                .iter()
                .find(|m| &m.model_id == requested)
                .ok_or_else(|| CoordinatorError::NotFound(format!("model {requested}")))?;
            let users: Vec<String> = models
                .iter()
                .filter(|m| !model_ids.contains(&m.model_id))
                .filter(|m| m.starting_model == requested.as_str())
                .map(|m| m.description.clone())
                .collect();
            if !users.is_empty() {
                messages.push(format!(
                    "The model \"{}\" cannot be deleted because it is used by {}.",
                    model.description,
                    describe_models(&users)
                ));
            }
        }
        Ok((messages.is_empty(), messages))
    }

    /// Mark the model deleted and trigger `DeleteModel`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing model.
    pub fn delete_model(&self, tenant_id: &TenantId, model_id: &ModelId) -> CoordinatorResult<()> {
        self.delete_models(tenant_id, std::slice::from_ref(model_id))
    }

    /// Mark every model in `model_ids` deleted in one transaction, then
    /// trigger one `DeleteModel` per model. Nothing is marked when any model
    /// is missing or the transaction fails.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing model, or a store failure.
    pub fn delete_models(&self, tenant_id: &TenantId, model_ids: &[ModelId]) -> CoordinatorResult<()> {
        run_transaction(self.store.as_ref(), self.attempts(), |txn| {
            for model_id in model_ids {
                let mut model: ModelRecord = txn
                    .load(&ModelRecord::key_for(tenant_id, model_id))?
                    .ok_or_else(|| CoordinatorError::NotFound(format!("model {model_id}")))?;
                model.delete_in_progress = true;
                txn.save(&model)?;
            }
            if let Some(mut tenant) = txn.load::<TenantRecord>(&TenantRecord::key_for(tenant_id))? {
                for model_id in model_ids {
                    push_unique(&mut tenant.models_deleted, model_id.clone());
                }
                txn.save(&tenant)?;
            }
            Ok(())
        })?;
        for model_id in model_ids {
            self.actions
                .trigger_new(Some(tenant_id), ActionKind::DeleteModel, json!({ "model_id": model_id }))?;
        }
        Ok(())
    }

    fn finish_delete_model(&self, params: ActionParams, time_limit: DateTime<Utc>) -> CoordinatorResult<ActionParams> {
        let tenant_id = params.tenant()?.clone();
        let model_id: ModelId = params.field("model_id")?;
        self.actions.retrigger_if_necessary(&params, time_limit)?;
        let removed = delete_prefix(
            self.blobs.as_ref(),
            self.bucket(),
            &ModelRecord::folder(&tenant_id, &model_id),
        )?;
        self.store
            .delete_multi(&[ModelRecord::key_for(&tenant_id, &model_id)])?;
        info!(tenant = %tenant_id, model = %model_id, blobs = removed, "model deleted");
        Ok(params)
    }
}

fn log_job_error(model: &ModelRecord) {
    let message = &model.train.error_message;
    match classify_error(message) {
        ErrorClass::Benign => {
            info!(job = %model.train.job_id, error = %message, "training job ended");
        }
        ErrorClass::OutOfMemory => {
            error!(
                job = %model.train.job_id,
                original_starting_model = %model.original_starting_model,
                batch_size = model.batch_size,
                train_frame_count = model.train_frame_count,
                error = %message,
                "training job ran out of memory"
            );
        }
        ErrorClass::Critical => {
            error!(job = %model.train.job_id, error = %message, "training job failed");
        }
    }
}

#[async_trait]
impl ActionHandler for TrainingLifecycle {
    async fn perform(&self, params: ActionParams, time_limit: DateTime<Utc>) -> CoordinatorResult<ActionParams> {
        match params.kind {
            ActionKind::MonitorTraining => self.monitor_training(params, time_limit).await,
            ActionKind::DeleteModel => self.finish_delete_model(params, time_limit),
            other => Err(CoordinatorError::BadInput(format!(
                "{other} is not a training action"
            ))),
        }
    }
}
