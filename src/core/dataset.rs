//! Dataset production, archive assembly, and dataset deletion.
//!
//! A dataset is produced as a set of records, one shard each, written by
//! independent `ProduceDatasetRecord` actions; the last record to finish
//! finalizes the dataset through [`ShardedProgress::try_finalize`]. Archives
//! follow the same pattern with one shard per partition, and are deleted
//! on request or once older than `archive_retention_minutes`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::action::{ActionKind, ActionParams, ActionProtocol};
use super::aggregator::{
    Aggregate, FinalizeOutcome, GroupTotals, ShardParent, ShardResult, ShardScope, ShardedProgress,
};
use super::entities::{push_unique, TenantRecord, VideoRecord};
use super::error::{CoordinatorError, CoordinatorResult};
use super::executor::ActionHandler;
use super::quota::QuotaLedger;
use super::training::ModelRecord;
use crate::infra::blob::{delete_prefix, BlobStore};
use crate::infra::store::{
    run_transaction, Entity, EntityKey, EntityKind, EntityStore, FilterOp, Query, StoreExt,
    TransactionExt,
};
use crate::util::{ms_from_datetime, Clock, DatasetId, TenantId, VideoId, ZipId};

/// Aggregation group of training records.
pub const TRAIN_GROUP: &str = "train";
/// Aggregation group of evaluation records.
pub const EVAL_GROUP: &str = "eval";

const SIGNED_URL_TTL_MINUTES: i64 = 10;

/// A produced dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Dataset id.
    pub dataset_id: DatasetId,
    /// Caller-supplied description.
    pub description: String,
    /// Source videos.
    pub video_ids: Vec<VideoId>,
    /// Share of frames reserved for evaluation, 0 to 100.
    pub eval_percent: f64,
    /// Creation time.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub create_time: DateTime<Utc>,
    /// Labels in label-map order.
    #[serde(default)]
    pub sorted_label_list: Vec<String>,
    /// Training records planned.
    #[serde(default)]
    pub train_record_count: u32,
    /// Evaluation records planned.
    #[serde(default)]
    pub eval_record_count: u32,
    /// Training frames planned.
    #[serde(default)]
    pub train_frame_count: u64,
    /// Evaluation frames planned.
    #[serde(default)]
    pub eval_frame_count: u64,
    /// Total records; `None` until production starts.
    #[serde(default)]
    pub total_record_count: Option<u32>,
    /// Label-map blob; `None` until production starts.
    #[serde(default)]
    pub label_map_blob_name: Option<String>,
    /// Set exactly once when every record is written.
    pub dataset_completed: bool,
    /// Training totals, written on completion.
    #[serde(default)]
    pub train: GroupTotals,
    /// Evaluation totals, written on completion.
    #[serde(default)]
    pub eval: GroupTotals,
    /// When the dataset completed.
    #[serde(default)]
    pub completed_time: Option<DateTime<Utc>>,
    /// Deletion has been requested.
    #[serde(default)]
    pub delete_in_progress: bool,
}

impl DatasetRecord {
    /// Address of a dataset.
    #[must_use]
    pub fn key_for(tenant_id: &TenantId, dataset_id: &DatasetId) -> EntityKey {
        EntityKey::new(EntityKind::Dataset, tenant_id.as_str(), dataset_id.as_str())
    }

    /// Folder holding the dataset's blobs.
    #[must_use]
    pub fn folder(tenant_id: &TenantId, dataset_id: &DatasetId) -> String {
        format!("datasets/{tenant_id}/{dataset_id}/")
    }

    fn scope(&self) -> ShardScope {
        ShardScope::new(&self.tenant_id, self.dataset_id.as_str())
    }
}

impl Entity for DatasetRecord {
    fn key(&self) -> EntityKey {
        Self::key_for(&self.tenant_id, &self.dataset_id)
    }
}

impl ShardParent for DatasetRecord {
    fn is_finalized(&self) -> bool {
        self.dataset_completed
    }

    fn finalize(&mut self, aggregate: &Aggregate, now: DateTime<Utc>) {
        self.train = aggregate.group(TRAIN_GROUP);
        self.eval = aggregate.group(EVAL_GROUP);
        self.dataset_completed = true;
        self.completed_time = Some(now);
    }
}

/// An archive of a dataset split into partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetZipRecord {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Archive id.
    pub zip_id: ZipId,
    /// Archived dataset.
    pub dataset_id: DatasetId,
    /// Number of partitions.
    pub partition_count: u32,
    /// Set once every partition is written.
    pub completed: bool,
    /// Partition blobs, in partition order.
    #[serde(default)]
    pub blob_names: Vec<String>,
    /// Files per partition, in partition order.
    #[serde(default)]
    pub partition_file_counts: Vec<u64>,
    /// Creation time.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub create_time: DateTime<Utc>,
    /// Deletion has been triggered.
    #[serde(default)]
    pub delete_in_progress: bool,
}

impl DatasetZipRecord {
    /// Address of an archive.
    #[must_use]
    pub fn key_for(tenant_id: &TenantId, zip_id: &ZipId) -> EntityKey {
        EntityKey::new(EntityKind::DatasetZip, tenant_id.as_str(), zip_id.as_str())
    }

    /// Folder holding an archive's partition blobs.
    #[must_use]
    pub fn folder(tenant_id: &TenantId, zip_id: &ZipId) -> String {
        format!("zips/{tenant_id}/{zip_id}/")
    }

    fn scope(tenant_id: &TenantId, zip_id: &ZipId) -> ShardScope {
        ShardScope::new(tenant_id, zip_id.as_str())
    }
}

impl Entity for DatasetZipRecord {
    fn key(&self) -> EntityKey {
        Self::key_for(&self.tenant_id, &self.zip_id)
    }
}

impl ShardParent for DatasetZipRecord {
    fn is_finalized(&self) -> bool {
        self.completed
    }

    fn finalize(&mut self, aggregate: &Aggregate, _now: DateTime<Utc>) {
        self.blob_names = aggregate.blob_names.clone();
        self.partition_file_counts = aggregate.shard_item_counts.clone();
        self.completed = true;
    }
}

/// Labels of one frame. `bboxes_text` holds one `x1,y1,x2,y2,label` line per
/// box; a frame without boxes is a negative example.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLabels {
    /// Source video.
    pub video_id: VideoId,
    /// Frame number within the video.
    pub frame_number: u32,
    /// Box annotations.
    pub bboxes_text: String,
}

impl FrameLabels {
    /// Labels of every box in the frame.
    #[must_use]
    pub fn labels(&self) -> Vec<&str> {
        self.bboxes_text
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() {
                    return None;
                }
                line.splitn(5, ',').nth(4).map(str::trim).filter(|l| !l.is_empty())
            })
            .collect()
    }
}

/// Frames assigned to one dataset record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPlan {
    /// Whether the record belongs to the evaluation split.
    pub is_eval: bool,
    /// Frames written into the record, in order.
    pub frames: Vec<FrameLabels>,
}

/// Production progress of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetProgress {
    /// Frames written so far.
    pub frames_written: u64,
    /// Frames planned.
    pub total_frames: u64,
    /// Whether the dataset is complete.
    pub completed: bool,
}

/// Progress of one archive partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionProgress {
    /// Files assigned to the partition.
    pub file_count: u64,
    /// Files written so far.
    pub files_written: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct BundleEntry {
    file_name: String,
    data: Vec<u8>,
}

/// Dataset workflows and their action bodies.
pub struct DatasetService {
    store: Arc<dyn EntityStore>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    actions: Arc<ActionProtocol>,
    shards: Arc<ShardedProgress>,
    ledger: Arc<QuotaLedger>,
}

impl DatasetService {
    /// Create the service.
    pub fn new(
        store: Arc<dyn EntityStore>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        actions: Arc<ActionProtocol>,
        shards: Arc<ShardedProgress>,
        ledger: Arc<QuotaLedger>,
    ) -> Self {
        Self {
            store,
            blobs,
            clock,
            actions,
            shards,
            ledger,
        }
    }

    fn bucket(&self) -> &str {
        &self.actions.config().artifacts_bucket
    }

    fn attempts(&self) -> u32 {
        self.actions.config().transaction_attempts
    }

    /// Create a dataset entity for `video_ids`.
    ///
    /// # Errors
    ///
    /// Returns `BadInput` for an out-of-range eval percentage or no videos,
    /// `NotFound` when a video is missing or the videos carry no labeled frame.
    pub fn prepare_dataset_production(
        &self,
        tenant_id: &TenantId,
        description: &str,
        video_ids: &[VideoId],
        eval_percent: f64,
    ) -> CoordinatorResult<DatasetId> {
        if !(0.0..=100.0).contains(&eval_percent) {
            return Err(CoordinatorError::BadInput(format!(
                "eval_percent {eval_percent} is outside 0..=100"
            )));
        }
        if video_ids.is_empty() {
            return Err(CoordinatorError::BadInput("a dataset needs at least one video".into()));
        }
        let mut labeled = 0_u64;
        for video_id in video_ids {
            let video: VideoRecord = self
                .store
                .load::<VideoRecord>(&VideoRecord::key_for(tenant_id, video_id))?
                .filter(|v| !v.delete_in_progress)
                .ok_or_else(|| CoordinatorError::NotFound(format!("video {video_id}")))?;
            labeled += u64::from(video.labeled_frame_count);
        }
        if labeled == 0 {
            return Err(CoordinatorError::NotFound(
                "no labeled frames were found in the videos".into(),
            ));
        }
        let dataset = DatasetRecord {
            tenant_id: tenant_id.clone(),
            dataset_id: DatasetId::generate(),
            description: description.to_string(),
            video_ids: video_ids.to_vec(),
            eval_percent,
            create_time: self.clock.now(),
            sorted_label_list: Vec::new(),
            train_record_count: 0,
            eval_record_count: 0,
            train_frame_count: 0,
            eval_frame_count: 0,
            total_record_count: None,
            label_map_blob_name: None,
            dataset_completed: false,
            train: GroupTotals::default(),
            eval: GroupTotals::default(),
            completed_time: None,
            delete_in_progress: false,
        };
        self.store.save(&dataset)?;
        info!(tenant = %tenant_id, dataset = %dataset.dataset_id, "dataset prepared");
        Ok(dataset.dataset_id)
    }

    /// Store the label map, record the plan, create one shard per record, and
    /// trigger one `ProduceDatasetRecord` per record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing dataset, `Conflict` when production
    /// already started.
    pub fn start_dataset_production(
        &self,
        tenant_id: &TenantId,
        dataset_id: &DatasetId,
        sorted_labels: &[String],
        records: Vec<RecordPlan>,
    ) -> CoordinatorResult<()> {
        let label_map_blob = format!("{}label_map.json", DatasetRecord::folder(tenant_id, dataset_id));
        self.blobs.write(
            self.bucket(),
            &label_map_blob,
            "application/json",
            serde_json::to_vec(sorted_labels)?,
        )?;
        let total = u32::try_from(records.len())
            .map_err(|_| CoordinatorError::BadInput("too many records".into()))?;
        let now = self.clock.now();
        let key = DatasetRecord::key_for(tenant_id, dataset_id);
        run_transaction(self.store.as_ref(), self.attempts(), |txn| {
            let mut dataset: DatasetRecord = txn
                .load(&key)?
                .ok_or_else(|| CoordinatorError::NotFound(format!("dataset {dataset_id}")))?;
            if dataset.total_record_count.is_some() {
                return Err(CoordinatorError::Conflict(format!(
                    "dataset {dataset_id} production already started"
                )));
            }
            dataset.sorted_label_list = sorted_labels.to_vec();
            dataset.train_record_count = 0;
            dataset.eval_record_count = 0;
            dataset.train_frame_count = 0;
            dataset.eval_frame_count = 0;
            for plan in &records {
                let frames = plan.frames.len() as u64;
                if plan.is_eval {
                    dataset.eval_record_count += 1;
                    dataset.eval_frame_count += frames;
                } else {
                    dataset.train_record_count += 1;
                    dataset.train_frame_count += frames;
                }
            }
            dataset.total_record_count = Some(total);
            dataset.label_map_blob_name = Some(label_map_blob.clone());
            txn.save(&dataset)?;
            QuotaLedger::record_dataset_created_in(txn, tenant_id, now)
        })?;

        let scope = ShardScope::new(tenant_id, dataset_id.as_str());
        let totals: Vec<u64> = records.iter().map(|r| r.frames.len() as u64).collect();
        self.shards.begin_with_totals(&scope, &totals)?;
        if records.is_empty() {
            self.shards.try_finalize::<DatasetRecord>(&scope, &key, 0)?;
            return Ok(());
        }
        for (record_number, plan) in records.into_iter().enumerate() {
            self.actions.trigger_new(
                Some(tenant_id),
                ActionKind::ProduceDatasetRecord,
                json!({
                    "dataset_id": dataset_id,
                    "record_number": record_number,
                    "is_eval": plan.is_eval,
                    "frames": plan.frames,
                }),
            )?;
        }
        info!(tenant = %tenant_id, dataset = %dataset_id, records = total, "dataset production started");
        Ok(())
    }

    /// One dataset, hidden once deletion has been requested.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing or deleted dataset.
    pub fn dataset(&self, tenant_id: &TenantId, dataset_id: &DatasetId) -> CoordinatorResult<DatasetRecord> {
        self.store
            .load::<DatasetRecord>(&DatasetRecord::key_for(tenant_id, dataset_id))?
            .filter(|d| !d.delete_in_progress)
            .ok_or_else(|| CoordinatorError::NotFound(format!("dataset {dataset_id}")))
    }

    /// The tenant's datasets, oldest first.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn datasets(&self, tenant_id: &TenantId) -> CoordinatorResult<Vec<DatasetRecord>> {
        let query = Query::kind(EntityKind::Dataset)
            .in_group(tenant_id.as_str())
            .filter_eq("delete_in_progress", false)
            .order_by("create_time");
        self.store.find(&query)
    }

    /// Frames written across the dataset's records.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing dataset.
    pub fn dataset_progress(&self, tenant_id: &TenantId, dataset_id: &DatasetId) -> CoordinatorResult<DatasetProgress> {
        let dataset = self.dataset(tenant_id, dataset_id)?;
        let total_frames = dataset.train_frame_count + dataset.eval_frame_count;
        let frames_written = if dataset.dataset_completed {
            total_frames
        } else if dataset.total_record_count.is_some() {
            self.shards.progress_total(&dataset.scope())?
        } else {
            0
        };
        Ok(DatasetProgress {
            frames_written,
            total_frames,
            completed: dataset.dataset_completed,
        })
    }

    /// Whether none of `dataset_ids` is used by a model. Returns one message
    /// per blocked dataset naming the models that use it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when a requested dataset does not exist.
    pub fn can_delete_datasets(&self, tenant_id: &TenantId, dataset_ids: &[DatasetId]) -> CoordinatorResult<(bool, Vec<String>)> {
        let mut users: BTreeMap<&DatasetId, (String, Vec<String>)> = BTreeMap::new();
        for dataset_id in dataset_ids {
            let dataset = self.dataset(tenant_id, dataset_id)?;
            users.insert(dataset_id, (dataset.description, Vec::new()));
        }
        let models: Vec<ModelRecord> =
            self.store.find(&Query::kind(EntityKind::Model).in_group(tenant_id.as_str()))?;
        for model in models.iter().filter(|m| !m.delete_in_progress) {
            for dataset_id in &model.dataset_ids {
                if let Some((_, names)) = users.get_mut(dataset_id) {
                    names.push(model.description.clone());
                }
            }
        }
        let messages: Vec<String> = users
            .values()
            .filter(|(_, models)| !models.is_empty())
            .map(|(description, models)| {
                format!(
                    "The dataset \"{description}\" cannot be deleted because it is used by {}.",
                    describe_models(models)
                )
            })
            .collect();
        Ok((messages.is_empty(), messages))
    }

    /// Mark the dataset deleted and trigger `DeleteDataset`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing dataset.
    pub fn delete_dataset(&self, tenant_id: &TenantId, dataset_id: &DatasetId) -> CoordinatorResult<()> {
        self.delete_datasets(tenant_id, std::slice::from_ref(dataset_id))
    }

    /// Mark every dataset in `dataset_ids` deleted in one transaction, then
    /// trigger one `DeleteDataset` per dataset. Nothing is marked when any
    /// dataset is missing or the transaction fails.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing dataset, or a store failure.
    pub fn delete_datasets(&self, tenant_id: &TenantId, dataset_ids: &[DatasetId]) -> CoordinatorResult<()> {
        run_transaction(self.store.as_ref(), self.attempts(), |txn| {
            for dataset_id in dataset_ids {
                let mut dataset: DatasetRecord = txn
                    .load(&DatasetRecord::key_for(tenant_id, dataset_id))?
                    .ok_or_else(|| CoordinatorError::NotFound(format!("dataset {dataset_id}")))?;
                dataset.delete_in_progress = true;
                txn.save(&dataset)?;
            }
            if let Some(mut tenant) = txn.load::<TenantRecord>(&TenantRecord::key_for(tenant_id))? {
                for dataset_id in dataset_ids {
                    push_unique(&mut tenant.datasets_deleted, dataset_id.clone());
                }
                txn.save(&tenant)?;
            }
            Ok(())
        })?;
        for dataset_id in dataset_ids {
            self.actions.trigger_new(
                Some(tenant_id),
                ActionKind::DeleteDataset,
                json!({ "dataset_id": dataset_id }),
            )?;
        }
        Ok(())
    }

    /// Begin an archive of a completed dataset split into `partition_count`
    /// partitions, counting a download, and trigger `ZipDataset`.
    ///
    /// # Errors
    ///
    /// Returns `BadInput` for zero partitions or an incomplete dataset, or
    /// `NotFound`.
    pub fn prepare_dataset_zip(&self, tenant_id: &TenantId, dataset_id: &DatasetId, partition_count: u32) -> CoordinatorResult<ZipId> {
        if partition_count == 0 {
            return Err(CoordinatorError::BadInput("partition_count must be positive".into()));
        }
        let dataset = self.dataset(tenant_id, dataset_id)?;
        if !dataset.dataset_completed {
            return Err(CoordinatorError::BadInput(format!(
                "dataset {dataset_id} is not complete"
            )));
        }
        self.delete_expired_zips(tenant_id)?;
        let zip = DatasetZipRecord {
            tenant_id: tenant_id.clone(),
            zip_id: ZipId::generate(),
            dataset_id: dataset_id.clone(),
            partition_count,
            completed: false,
            blob_names: Vec::new(),
            partition_file_counts: Vec::new(),
            create_time: self.clock.now(),
            delete_in_progress: false,
        };
        self.store.save(&zip)?;
        self.shards
            .begin(&DatasetZipRecord::scope(tenant_id, &zip.zip_id), partition_count)?;
        self.ledger.record_dataset_downloaded(tenant_id)?;
        self.actions.trigger_new(
            Some(tenant_id),
            ActionKind::ZipDataset,
            json!({
                "zip_id": zip.zip_id,
                "dataset_id": dataset_id,
                "partition_count": partition_count,
            }),
        )?;
        Ok(zip.zip_id)
    }

    /// Per-partition progress of an archive.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` unless every partition record exists.
    pub fn zip_progress(&self, tenant_id: &TenantId, zip_id: &ZipId, partition_count: u32) -> CoordinatorResult<Vec<PartitionProgress>> {
        if let Some(zip) = self
            .store
            .load::<DatasetZipRecord>(&DatasetZipRecord::key_for(tenant_id, zip_id))?
            .filter(|z| z.completed && z.partition_count == partition_count)
        {
            return Ok(zip
                .partition_file_counts
                .iter()
                .map(|n| PartitionProgress {
                    file_count: *n,
                    files_written: *n,
                })
                .collect());
        }
        let records = self
            .shards
            .progress_by_shard(&DatasetZipRecord::scope(tenant_id, zip_id), partition_count)?;
        Ok(records
            .iter()
            .map(|r| PartitionProgress {
                file_count: r.total,
                files_written: r.progress,
            })
            .collect())
    }

    /// Signed download URLs for a finished archive, `None` while partitions
    /// are still being written.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing archive.
    pub fn zip_download_urls(&self, tenant_id: &TenantId, zip_id: &ZipId) -> CoordinatorResult<Option<Vec<String>>> {
        let zip: DatasetZipRecord = self
            .store
            .load::<DatasetZipRecord>(&DatasetZipRecord::key_for(tenant_id, zip_id))?
            .filter(|z| !z.delete_in_progress)
            .ok_or_else(|| CoordinatorError::NotFound(format!("dataset zip {zip_id}")))?;
        if !zip.completed {
            return Ok(None);
        }
        let ttl = Duration::minutes(SIGNED_URL_TTL_MINUTES);
        let mut urls = Vec::with_capacity(zip.blob_names.len());
        for name in &zip.blob_names {
            let url = self
                .blobs
                .signed_url(self.bucket(), name, ttl)?
                .ok_or_else(|| CoordinatorError::NotFound(format!("blob {name}")))?;
            urls.push(url);
        }
        Ok(Some(urls))
    }

    /// Mark an archive deleted and trigger `DeleteDatasetZip`. Download URLs
    /// already handed out stop working once it runs.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing archive.
    pub fn delete_dataset_zip(&self, tenant_id: &TenantId, zip_id: &ZipId) -> CoordinatorResult<()> {
        let key = DatasetZipRecord::key_for(tenant_id, zip_id);
        let newly_marked = run_transaction(self.store.as_ref(), self.attempts(), |txn| {
            let mut zip: DatasetZipRecord = txn
                .load(&key)?
                .ok_or_else(|| CoordinatorError::NotFound(format!("dataset zip {zip_id}")))?;
            if zip.delete_in_progress {
                return Ok(false);
            }
            zip.delete_in_progress = true;
            txn.save(&zip)?;
            Ok(true)
        })?;
        if newly_marked {
            self.actions.trigger_new(
                Some(tenant_id),
                ActionKind::DeleteDatasetZip,
                json!({ "zip_id": zip_id }),
            )?;
        }
        Ok(())
    }

    /// Trigger deletion of the tenant's archives created more than
    /// `archive_retention_minutes` ago. Returns how many were scheduled.
    ///
    /// # Errors
    ///
    /// Propagates store and blob failures.
    pub fn delete_expired_zips(&self, tenant_id: &TenantId) -> CoordinatorResult<usize> {
        let retention = Duration::minutes(self.actions.config().archive_retention_minutes);
        let cutoff = ms_from_datetime(self.clock.now() - retention);
        let query = Query::kind(EntityKind::DatasetZip)
            .in_group(tenant_id.as_str())
            .filter_eq("delete_in_progress", false)
            .filter("create_time", FilterOp::Lt, cutoff);
        let expired: Vec<DatasetZipRecord> = self.store.find(&query)?;
        for zip in &expired {
            self.delete_dataset_zip(tenant_id, &zip.zip_id)?;
        }
        if !expired.is_empty() {
            debug!(tenant = %tenant_id, count = expired.len(), "expired archives scheduled for deletion");
        }
        Ok(expired.len())
    }

    fn produce_record(&self, mut params: ActionParams, time_limit: DateTime<Utc>) -> CoordinatorResult<ActionParams> {
        let tenant_id = params.tenant()?.clone();
        let dataset_id: DatasetId = params.field("dataset_id")?;
        let record_number: u32 = params.field("record_number")?;
        let is_eval: bool = params.field("is_eval")?;
        let frames: Vec<FrameLabels> = params.field("frames")?;
        let mut frames_written: u64 = params.field_or_default("frames_written")?;
        let scope = ShardScope::new(&tenant_id, dataset_id.as_str());

        let mut result = ShardResult {
            group: if is_eval { EVAL_GROUP } else { TRAIN_GROUP }.to_string(),
            item_count: frames.len() as u64,
            ..ShardResult::default()
        };
        for (index, frame) in frames.iter().enumerate() {
            let labels = frame.labels();
            if labels.is_empty() {
                result.negative_count += 1;
            }
            for label in labels {
                *result.label_counts.entry(label.to_string()).or_insert(0) += 1;
            }
            let written = index as u64 + 1;
            if written > frames_written {
                self.actions.retrigger_if_necessary(&params, time_limit)?;
                frames_written = written;
                params.set_field("frames_written", frames_written)?;
                self.shards.update_shard(&scope, record_number, frames_written, None)?;
            }
        }

        let split = if is_eval { EVAL_GROUP } else { TRAIN_GROUP };
        let blob_name = format!(
            "{}{split}/record_{record_number:05}.json",
            DatasetRecord::folder(&tenant_id, &dataset_id)
        );
        self.blobs
            .write(self.bucket(), &blob_name, "application/json", serde_json::to_vec(&frames)?)?;
        result.blob_name = Some(blob_name);
        self.shards.mark_shard_complete(&scope, record_number, result)?;

        let Some(dataset) = self
            .store
            .load::<DatasetRecord>(&DatasetRecord::key_for(&tenant_id, &dataset_id))?
        else {
            warn!(tenant = %tenant_id, dataset = %dataset_id, "dataset vanished while producing a record");
            return Ok(params);
        };
        let expected = dataset.total_record_count.unwrap_or_default();
        let outcome = self.shards.try_finalize::<DatasetRecord>(&scope, &dataset.key(), expected)?;
        if let FinalizeOutcome::Finalized(_) = outcome {
            info!(tenant = %tenant_id, dataset = %dataset_id, "dataset completed");
        }
        Ok(params)
    }

    fn finish_delete_dataset(&self, params: ActionParams, time_limit: DateTime<Utc>) -> CoordinatorResult<ActionParams> {
        let tenant_id = params.tenant()?.clone();
        let dataset_id: DatasetId = params.field("dataset_id")?;
        let scope = ShardScope::new(&tenant_id, dataset_id.as_str());
        self.purge_shards(&scope, &params, time_limit)?;
        delete_prefix(
            self.blobs.as_ref(),
            self.bucket(),
            &DatasetRecord::folder(&tenant_id, &dataset_id),
        )?;
        self.store
            .delete_multi(&[DatasetRecord::key_for(&tenant_id, &dataset_id)])?;
        info!(tenant = %tenant_id, dataset = %dataset_id, "dataset deleted");
        Ok(params)
    }

    /// Delete every shard record under `scope` with the blobs its results
    /// name, a page at a time.
    fn purge_shards(&self, scope: &ShardScope, params: &ActionParams, time_limit: DateTime<Utc>) -> CoordinatorResult<()> {
        let page_size = self.actions.config().delete_page_size;
        loop {
            self.actions.retrigger_if_necessary(params, time_limit)?;
            let page = self.shards.results(scope, page_size)?;
            if page.is_empty() {
                break;
            }
            self.actions.retrigger_if_necessary(params, time_limit)?;
            for blob in page.iter().filter_map(|r| r.result.as_ref()?.blob_name.as_ref()) {
                self.blobs.delete(self.bucket(), blob)?;
            }
            self.actions.retrigger_if_necessary(params, time_limit)?;
            self.shards.delete_results_page(scope, page_size)?;
        }
        loop {
            self.actions.retrigger_if_necessary(params, time_limit)?;
            if self.shards.delete_progress_page(scope, page_size)? == 0 {
                break;
            }
        }
        self.actions.retrigger_if_necessary(params, time_limit)
    }

    fn finish_delete_dataset_zip(&self, params: ActionParams, time_limit: DateTime<Utc>) -> CoordinatorResult<ActionParams> {
        let tenant_id = params.tenant()?.clone();
        let zip_id: ZipId = params.field("zip_id")?;
        self.purge_shards(&DatasetZipRecord::scope(&tenant_id, &zip_id), &params, time_limit)?;
        delete_prefix(
            self.blobs.as_ref(),
            self.bucket(),
            &DatasetZipRecord::folder(&tenant_id, &zip_id),
        )?;
        self.store
            .delete_multi(&[DatasetZipRecord::key_for(&tenant_id, &zip_id)])?;
        info!(tenant = %tenant_id, zip = %zip_id, "archive deleted");
        Ok(params)
    }

    fn zip_dataset(&self, params: ActionParams, time_limit: DateTime<Utc>) -> CoordinatorResult<ActionParams> {
        self.actions.retrigger_if_necessary(&params, time_limit)?;
        let tenant_id = params.tenant()?.clone();
        let zip_id: ZipId = params.field("zip_id")?;
        let dataset_id: DatasetId = params.field("dataset_id")?;
        let partition_count: u32 = params.field("partition_count")?;
        if partition_count == 0 {
            return Err(CoordinatorError::BadInput("partition_count must be positive".into()));
        }
        let dataset = self.dataset(&tenant_id, &dataset_id)?;

        let mut partitions: Vec<Vec<String>> = vec![Vec::new(); partition_count as usize];
        if let Some(label_map) = &dataset.label_map_blob_name {
            partitions[0].push(label_map.clone());
        }
        let expected = dataset.total_record_count.unwrap_or_default() as usize;
        let records = self.shards.results(&dataset.scope(), expected)?;
        for (i, record) in records.iter().enumerate() {
            if let Some(blob) = record.result.as_ref().and_then(|r| r.blob_name.clone()) {
                partitions[(i + 1) % partition_count as usize].push(blob);
            }
        }

        let zip_scope = DatasetZipRecord::scope(&tenant_id, &zip_id);
        for (partition_index, files) in partitions.into_iter().enumerate() {
            let index = u32::try_from(partition_index).unwrap_or(u32::MAX);
            self.shards
                .update_shard(&zip_scope, index, 0, Some(files.len() as u64))?;
            self.actions.trigger_new(
                Some(&tenant_id),
                ActionKind::ZipDatasetPartition,
                json!({
                    "zip_id": zip_id,
                    "partition_index": index,
                    "partition_count": partition_count,
                    "files": files,
                }),
            )?;
        }
        debug!(tenant = %tenant_id, zip = %zip_id, partition_count, "archive partitions planned");
        Ok(params)
    }

    fn zip_partition(&self, mut params: ActionParams, time_limit: DateTime<Utc>) -> CoordinatorResult<ActionParams> {
        let tenant_id = params.tenant()?.clone();
        let zip_id: ZipId = params.field("zip_id")?;
        let partition_index: u32 = params.field("partition_index")?;
        let partition_count: u32 = params.field("partition_count")?;
        let files: Vec<String> = params.field("files")?;
        let mut files_written: u64 = params.field_or_default("files_written")?;
        let scope = DatasetZipRecord::scope(&tenant_id, &zip_id);

        let mut bundle = Vec::with_capacity(files.len());
        for (index, name) in files.iter().enumerate() {
            let data = self
                .blobs
                .read(self.bucket(), name)?
                .ok_or_else(|| CoordinatorError::NotFound(format!("blob {name}")))?;
            let file_name = name.rsplit('/').next().unwrap_or(name).to_string();
            bundle.push(BundleEntry { file_name, data });
            let written = index as u64 + 1;
            if written > files_written {
                self.actions.retrigger_if_necessary(&params, time_limit)?;
                files_written = written;
                params.set_field("files_written", files_written)?;
                self.shards
                    .update_shard(&scope, partition_index, files_written, Some(files.len() as u64))?;
            }
        }

        let blob_name = format!(
            "{}partition_{partition_index:03}.json",
            DatasetZipRecord::folder(&tenant_id, &zip_id)
        );
        self.blobs
            .write(self.bucket(), &blob_name, "application/json", serde_json::to_vec(&bundle)?)?;
        self.shards.mark_shard_complete(
            &scope,
            partition_index,
            ShardResult {
                group: "files".into(),
                blob_name: Some(blob_name),
                item_count: files.len() as u64,
                ..ShardResult::default()
            },
        )?;
        let outcome = self.shards.try_finalize::<DatasetZipRecord>(
            &scope,
            &DatasetZipRecord::key_for(&tenant_id, &zip_id),
            partition_count,
        )?;
        if let FinalizeOutcome::Finalized(_) = outcome {
            info!(tenant = %tenant_id, zip = %zip_id, "archive completed");
        }
        Ok(params)
    }
}

/// Join model descriptions into prose: `the model "a"`, `the models "a" and "b"`.
pub(crate) fn describe_models(models: &[String]) -> String {
    match models {
        [only] => format!("the model \"{only}\""),
        [first, second] => format!("the models \"{first}\" and \"{second}\""),
        [rest @ .., last] => {
            let head: Vec<String> = rest.iter().map(|m| format!("\"{m}\"")).collect();
            format!("the models {}, and \"{last}\"", head.join(", "))
        }
        [] => String::new(),
    }
}

#[async_trait]
impl ActionHandler for DatasetService {
    async fn perform(&self, params: ActionParams, time_limit: DateTime<Utc>) -> CoordinatorResult<ActionParams> {
        match params.kind {
            ActionKind::ProduceDatasetRecord => self.produce_record(params, time_limit),
            ActionKind::DeleteDataset => self.finish_delete_dataset(params, time_limit),
            ActionKind::ZipDataset => self.zip_dataset(params, time_limit),
            ActionKind::ZipDatasetPartition => self.zip_partition(params, time_limit),
            ActionKind::DeleteDatasetZip => self.finish_delete_dataset_zip(params, time_limit),
            other => Err(CoordinatorError::BadInput(format!(
                "{other} is not a dataset action"
            ))),
        }
    }
}
