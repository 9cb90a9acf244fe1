//! Video catalog: registration, labeling counts, and deletion.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::info;

use super::action::{ActionKind, ActionParams, ActionProtocol};
use super::entities::{push_unique, TenantRecord, VideoRecord};
use super::error::{CoordinatorError, CoordinatorResult};
use super::executor::ActionHandler;
use super::liveness::TrackingSessions;
use super::quota::QuotaLedger;
use crate::infra::blob::{delete_prefix, BlobStore};
use crate::infra::store::{run_transaction, EntityKind, EntityStore, Query, StoreExt, TransactionExt};
use crate::util::{Clock, TenantId, VideoId};

/// Registers videos and runs `DeleteVideo`.
pub struct VideoCatalog {
    store: Arc<dyn EntityStore>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    actions: Arc<ActionProtocol>,
    ledger: Arc<QuotaLedger>,
    sessions: Arc<TrackingSessions>,
}

impl VideoCatalog {
    /// Create the catalog.
    pub fn new(
        store: Arc<dyn EntityStore>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        actions: Arc<ActionProtocol>,
        ledger: Arc<QuotaLedger>,
        sessions: Arc<TrackingSessions>,
    ) -> Self {
        Self {
            store,
            blobs,
            clock,
            actions,
            ledger,
            sessions,
        }
    }

    /// Register an uploaded video whose frames have been extracted, counting
    /// the upload against today's counters.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing tenant.
    pub fn create_video(&self, tenant_id: &TenantId, description: &str, frame_count: u32) -> CoordinatorResult<VideoId> {
        self.ledger.record_video_uploaded(tenant_id)?;
        let video = VideoRecord {
            tenant_id: tenant_id.clone(),
            video_id: VideoId::generate(),
            description: description.to_string(),
            frame_count,
            labeled_frame_count: 0,
            tracking_in_progress: false,
            tracker_session: None,
            delete_in_progress: false,
            create_time: self.clock.now(),
        };
        self.store.save(&video)?;
        info!(tenant = %tenant_id, video = %video.video_id, frame_count, "video registered");
        Ok(video.video_id)
    }

    /// Record how many frames carry labels.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing video, `BadInput` when the count
    /// exceeds the frame count.
    pub fn set_labeled_frame_count(&self, tenant_id: &TenantId, video_id: &VideoId, labeled: u32) -> CoordinatorResult<()> {
        let key = VideoRecord::key_for(tenant_id, video_id);
        run_transaction(self.store.as_ref(), self.actions.config().transaction_attempts, |txn| {
            let mut video: VideoRecord = txn
                .load(&key)?
                .ok_or_else(|| CoordinatorError::NotFound(format!("video {video_id}")))?;
            if labeled > video.frame_count {
                return Err(CoordinatorError::BadInput(format!(
                    "{labeled} labeled frames exceed {} frames",
                    video.frame_count
                )));
            }
            video.labeled_frame_count = labeled;
            txn.save(&video)
        })
    }

    /// One video, hidden once deletion has been requested.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing or deleted video.
    pub fn video(&self, tenant_id: &TenantId, video_id: &VideoId) -> CoordinatorResult<VideoRecord> {
        self.store
            .load::<VideoRecord>(&VideoRecord::key_for(tenant_id, video_id))?
            .filter(|v| !v.delete_in_progress)
            .ok_or_else(|| CoordinatorError::NotFound(format!("video {video_id}")))
    }

    /// The tenant's videos, oldest first.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn videos(&self, tenant_id: &TenantId) -> CoordinatorResult<Vec<VideoRecord>> {
        let query = Query::kind(EntityKind::Video)
            .in_group(tenant_id.as_str())
            .filter_eq("delete_in_progress", false)
            .order_by("create_time");
        self.store.find(&query)
    }

    /// Request deletion. A video with a live tracking session is a
    /// `Conflict`; a stale session is torn down first.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `Conflict`.
    pub fn delete_video(&self, tenant_id: &TenantId, video_id: &VideoId) -> CoordinatorResult<()> {
        if self.sessions.is_tracking_in_progress(tenant_id, video_id)? {
            return Err(CoordinatorError::Conflict(format!(
                "video {video_id} is being tracked"
            )));
        }
        run_transaction(self.store.as_ref(), self.actions.config().transaction_attempts, |txn| {
            let mut video: VideoRecord = txn
                .load(&VideoRecord::key_for(tenant_id, video_id))?
                .ok_or_else(|| CoordinatorError::NotFound(format!("video {video_id}")))?;
            if video.tracking_in_progress {
                return Err(CoordinatorError::Conflict(format!(
                    "video {video_id} is being tracked"
                )));
            }
            video.delete_in_progress = true;
            txn.save(&video)?;
            if let Some(mut tenant) = txn.load::<TenantRecord>(&TenantRecord::key_for(tenant_id))? {
                push_unique(&mut tenant.videos_deleted, video_id.clone());
                txn.save(&tenant)?;
            }
            Ok(())
        })?;
        self.actions
            .trigger_new(Some(tenant_id), ActionKind::DeleteVideo, json!({ "video_id": video_id }))?;
        Ok(())
    }
}

#[async_trait]
impl ActionHandler for VideoCatalog {
    async fn perform(&self, params: ActionParams, time_limit: DateTime<Utc>) -> CoordinatorResult<ActionParams> {
        let tenant_id = params.tenant()?.clone();
        let video_id: VideoId = params.field("video_id")?;
        self.actions.retrigger_if_necessary(&params, time_limit)?;
        let removed = delete_prefix(
            self.blobs.as_ref(),
            &self.actions.config().artifacts_bucket,
            &VideoRecord::folder(&tenant_id, &video_id),
        )?;
        self.store
            .delete_multi(&[VideoRecord::key_for(&tenant_id, &video_id)])?;
        info!(tenant = %tenant_id, video = %video_id, blobs = removed, "video deleted");
        Ok(params)
    }
}
