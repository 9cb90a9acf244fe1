//! Records shared by several coordination components: the tenant ledger and
//! uploaded videos.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::infra::store::{Entity, EntityKey, EntityKind};
use crate::util::{DatasetId, ModelId, SessionId, TenantId, VideoId};

/// Per-day usage counters, reset lazily on the first read of a new UTC day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCounters {
    /// Videos uploaded today.
    pub videos_uploaded: u32,
    /// Datasets created today.
    pub datasets_created: u32,
    /// Dataset archives downloaded today.
    pub datasets_downloaded: u32,
}

/// Ledger entity for one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantRecord {
    /// Tenant id.
    pub tenant_id: TenantId,
    /// Unique display name; administrative sweeps visit tenants in name order.
    pub name: String,
    /// Training-minute balance.
    pub remaining_training_minutes: i64,
    /// Creation time.
    pub create_time: DateTime<Utc>,
    /// Last time the record was read through the ledger.
    pub last_time: DateTime<Utc>,
    /// Counters for the day of `last_time`.
    pub daily: DailyCounters,
    /// Videos with a live tracking session.
    #[serde(default)]
    pub videos_tracking_now: Vec<VideoId>,
    /// Videos deleted by this tenant.
    #[serde(default)]
    pub videos_deleted: Vec<VideoId>,
    /// Datasets deleted by this tenant.
    #[serde(default)]
    pub datasets_deleted: Vec<DatasetId>,
    /// Models deleted by this tenant.
    #[serde(default)]
    pub models_deleted: Vec<ModelId>,
}

impl TenantRecord {
    /// Fresh ledger with `initial_minutes` of training time.
    #[must_use]
    pub fn new(tenant_id: TenantId, name: impl Into<String>, initial_minutes: i64, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id,
            name: name.into(),
            remaining_training_minutes: initial_minutes,
            create_time: now,
            last_time: now,
            daily: DailyCounters::default(),
            videos_tracking_now: Vec::new(),
            videos_deleted: Vec::new(),
            datasets_deleted: Vec::new(),
            models_deleted: Vec::new(),
        }
    }

    /// Address of the tenant ledger.
    #[must_use]
    pub fn key_for(tenant_id: &TenantId) -> EntityKey {
        EntityKey::new(EntityKind::Tenant, tenant_id.as_str(), tenant_id.as_str())
    }

    /// Reset the daily counters if `now` falls on a later UTC day than the
    /// last read. Returns whether the record changed.
    pub fn refresh_day(&mut self, now: DateTime<Utc>) -> bool {
        if now.date_naive() == self.last_time.date_naive() {
            return false;
        }
        self.daily = DailyCounters::default();
        self.last_time = now;
        true
    }
}

impl Entity for TenantRecord {
    fn key(&self) -> EntityKey {
        Self::key_for(&self.tenant_id)
    }
}

/// Append `item` unless it is already present. Returns whether it was added.
pub fn push_unique<T: PartialEq>(list: &mut Vec<T>, item: T) -> bool {
    if list.contains(&item) {
        return false;
    }
    list.push(item);
    true
}

/// An uploaded video whose frames feed tracking and dataset production.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRecord {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Video id.
    pub video_id: VideoId,
    /// Caller-supplied description.
    pub description: String,
    /// Frames extracted from the upload.
    pub frame_count: u32,
    /// Frames carrying at least one label.
    pub labeled_frame_count: u32,
    /// Whether an interactive tracking session is attached.
    #[serde(default)]
    pub tracking_in_progress: bool,
    /// Attached tracking session.
    #[serde(default)]
    pub tracker_session: Option<SessionId>,
    /// Deletion has been requested.
    #[serde(default)]
    pub delete_in_progress: bool,
    /// Upload time.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub create_time: DateTime<Utc>,
}

impl VideoRecord {
    /// Address of a video.
    #[must_use]
    pub fn key_for(tenant_id: &TenantId, video_id: &VideoId) -> EntityKey {
        EntityKey::new(EntityKind::Video, tenant_id.as_str(), video_id.as_str())
    }

    /// Folder holding the video's blobs.
    #[must_use]
    pub fn folder(tenant_id: &TenantId, video_id: &VideoId) -> String {
        format!("videos/{tenant_id}/{video_id}/")
    }
}

impl Entity for VideoRecord {
    fn key(&self) -> EntityKey {
        Self::key_for(&self.tenant_id, &self.video_id)
    }
}
