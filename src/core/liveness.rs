//! Heartbeat-based liveness for interactive tracking sessions.
//!
//! A session pairs a producer record (the tracker writing frame results) with
//! a consumer record (the client reading them). Each side refreshes its own
//! timestamp; either side older than the staleness threshold kills the whole
//! session, and whoever notices tears it down.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::entities::{push_unique, TenantRecord, VideoRecord};
use super::error::{CoordinatorError, CoordinatorResult};
use crate::config::LivenessConfig;
use crate::infra::store::{
    run_transaction, Entity, EntityKey, EntityKind, EntityStore, StoreExt, Transaction, TransactionExt,
};
use crate::util::{Clock, SessionId, TenantId, VideoId};

/// Side of a tracking session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Tracker producing frame results.
    Producer,
    /// Client consuming them.
    Consumer,
}

/// Producer heartbeat and latest result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerProducer {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Tracked video.
    pub video_id: VideoId,
    /// Session id.
    pub session_id: SessionId,
    /// Frame the payload belongs to.
    pub frame_number: u32,
    /// Latest tracking result.
    pub payload: Value,
    /// Last heartbeat.
    pub update_time: DateTime<Utc>,
}

impl TrackerProducer {
    /// Address of a producer record.
    #[must_use]
    pub fn key_for(tenant_id: &TenantId, session_id: &SessionId) -> EntityKey {
        EntityKey::new(EntityKind::TrackerProducer, tenant_id.as_str(), session_id.as_str())
    }
}

impl Entity for TrackerProducer {
    fn key(&self) -> EntityKey {
        Self::key_for(&self.tenant_id, &self.session_id)
    }
}

/// Consumer heartbeat and requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerConsumer {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Tracked video.
    pub video_id: VideoId,
    /// Session id.
    pub session_id: SessionId,
    /// Latest frame the consumer has moved to.
    pub frame_number: u32,
    /// The consumer asked the producer to stop.
    pub stop_requested: bool,
    /// Last heartbeat.
    pub update_time: DateTime<Utc>,
}

impl TrackerConsumer {
    /// Address of a consumer record.
    #[must_use]
    pub fn key_for(tenant_id: &TenantId, session_id: &SessionId) -> EntityKey {
        EntityKey::new(EntityKind::TrackerConsumer, tenant_id.as_str(), session_id.as_str())
    }
}

impl Entity for TrackerConsumer {
    fn key(&self) -> EntityKey {
        Self::key_for(&self.tenant_id, &self.session_id)
    }
}

/// Liveness of a session as seen by an inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No heartbeat records exist.
    Absent,
    /// Both sides are fresh.
    Active,
    /// At least one side missed the staleness threshold, or one side is gone.
    Stale,
    /// The consumer asked to stop.
    Terminated,
}

/// Result of a consumer-side poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The producer reached the expected frame.
    Ready(TrackerProducer),
    /// The deadline is near; carries the latest producer state.
    Pending(TrackerProducer),
    /// The session is gone or was torn down for staleness.
    Failed,
}

/// Tracking session coordinator.
pub struct TrackingSessions {
    store: Arc<dyn EntityStore>,
    clock: Arc<dyn Clock>,
    config: LivenessConfig,
    attempts: u32,
    producer_updated: Notify,
}

impl TrackingSessions {
    /// Create the coordinator.
    pub fn new(store: Arc<dyn EntityStore>, clock: Arc<dyn Clock>, config: LivenessConfig, attempts: u32) -> Self {
        Self {
            store,
            clock,
            config,
            attempts,
            producer_updated: Notify::new(),
        }
    }

    fn is_stale(&self, update_time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - update_time > self.config.staleness_threshold()
    }

    /// Start a session on `video_id` with the producer's initial state. A
    /// session already attached to the video is a `Conflict` unless it is
    /// stale, in which case it is torn down first.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing video or tenant, or `Conflict`.
    pub fn start(
        &self,
        tenant_id: &TenantId,
        video_id: &VideoId,
        init_frame_number: u32,
        init_payload: Value,
    ) -> CoordinatorResult<SessionId> {
        if self.is_tracking_in_progress(tenant_id, video_id)? {
            return Err(CoordinatorError::Conflict(format!(
                "video {video_id} is already being tracked"
            )));
        }
        let now = self.clock.now();
        let session_id = SessionId::generate();
        run_transaction(self.store.as_ref(), self.attempts, |txn| {
            let mut video = load_video(txn, tenant_id, video_id)?;
            if video.delete_in_progress {
                return Err(CoordinatorError::Conflict(format!("video {video_id} is being deleted")));
            }
            if video.tracking_in_progress {
                return Err(CoordinatorError::Conflict(format!(
                    "video {video_id} is already being tracked"
                )));
            }
            let mut tenant = load_tenant(txn, tenant_id)?;
            video.tracking_in_progress = true;
            video.tracker_session = Some(session_id.clone());
            push_unique(&mut tenant.videos_tracking_now, video_id.clone());
            txn.save(&video)?;
            txn.save(&tenant)?;
            txn.save(&TrackerProducer {
                tenant_id: tenant_id.clone(),
                video_id: video_id.clone(),
                session_id: session_id.clone(),
                frame_number: init_frame_number,
                payload: init_payload.clone(),
                update_time: now,
            })?;
            txn.save(&TrackerConsumer {
                tenant_id: tenant_id.clone(),
                video_id: video_id.clone(),
                session_id: session_id.clone(),
                frame_number: init_frame_number,
                stop_requested: false,
                update_time: now,
            })
        })?;
        info!(tenant = %tenant_id, video = %video_id, session = %session_id, "tracking started");
        Ok(session_id)
    }

    /// Refresh one side's timestamp.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when that side's record is gone.
    pub fn heartbeat(&self, tenant_id: &TenantId, session_id: &SessionId, role: Role) -> CoordinatorResult<()> {
        let now = self.clock.now();
        match role {
            Role::Producer => self
                .update_producer(tenant_id, session_id, |p| p.update_time = now)
                .map(|_| ()),
            Role::Consumer => self
                .update_consumer(tenant_id, session_id, |c| c.update_time = now)
                .map(|_| ()),
        }
    }

    /// Producer publishes the result for `frame_number`, refreshing its
    /// heartbeat and waking pollers.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the session is gone.
    pub fn store_producer_state(
        &self,
        tenant_id: &TenantId,
        session_id: &SessionId,
        frame_number: u32,
        payload: Value,
    ) -> CoordinatorResult<()> {
        let now = self.clock.now();
        self.update_producer(tenant_id, session_id, |p| {
            p.frame_number = frame_number;
            p.payload = payload.clone();
            p.update_time = now;
        })?;
        self.producer_updated.notify_waiters();
        Ok(())
    }

    /// Consumer moves to `frame_number`, refreshing its heartbeat.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the session is gone.
    pub fn continue_tracking(&self, tenant_id: &TenantId, session_id: &SessionId, frame_number: u32) -> CoordinatorResult<()> {
        let now = self.clock.now();
        self.update_consumer(tenant_id, session_id, |c| {
            c.frame_number = frame_number;
            c.update_time = now;
        })
        .map(|_| ())
    }

    /// Consumer asks the producer to stop.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the session is gone.
    pub fn request_stop(&self, tenant_id: &TenantId, session_id: &SessionId) -> CoordinatorResult<()> {
        let now = self.clock.now();
        self.update_consumer(tenant_id, session_id, |c| {
            c.stop_requested = true;
            c.update_time = now;
        })
        .map(|_| ())
    }

    /// Producer-side check, refreshing the producer heartbeat. False when the
    /// consumer is gone, asked to stop, or is stale; a stale consumer tears
    /// the session down.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn producer_should_continue(&self, tenant_id: &TenantId, session_id: &SessionId) -> CoordinatorResult<bool> {
        let now = self.clock.now();
        match self.update_producer(tenant_id, session_id, |p| p.update_time = now) {
            Ok(_) => {}
            Err(CoordinatorError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        }
        let Some(consumer) = self
            .store
            .load::<TrackerConsumer>(&TrackerConsumer::key_for(tenant_id, session_id))?
        else {
            return Ok(false);
        };
        if consumer.stop_requested {
            return Ok(false);
        }
        if self.is_stale(consumer.update_time, now) {
            self.stop(tenant_id, session_id, "consumer heartbeat stale")?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Consumer-side wait for the producer to reach `expected_frame`.
    ///
    /// Refreshes the consumer heartbeat, then re-reads the producer until it
    /// reaches the frame (`Ready`), the deadline minus the poll margin passes
    /// (`Pending` with the latest state), or the producer heartbeat goes stale
    /// (session torn down, `Failed`). Waits between reads are bounded by the
    /// poll interval and cut short by producer writes.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn poll(
        &self,
        tenant_id: &TenantId,
        session_id: &SessionId,
        expected_frame: u32,
        deadline: DateTime<Utc>,
    ) -> CoordinatorResult<PollOutcome> {
        match self.heartbeat(tenant_id, session_id, Role::Consumer) {
            Ok(()) => {}
            Err(CoordinatorError::NotFound(_)) => return Ok(PollOutcome::Failed),
            Err(e) => return Err(e),
        }
        let key = TrackerProducer::key_for(tenant_id, session_id);
        loop {
            let Some(producer) = self.store.load::<TrackerProducer>(&key)? else {
                return Ok(PollOutcome::Failed);
            };
            if producer.frame_number == expected_frame {
                return Ok(PollOutcome::Ready(producer));
            }
            let now = self.clock.now();
            if now >= deadline - self.config.poll_margin() {
                return Ok(PollOutcome::Pending(producer));
            }
            if self.is_stale(producer.update_time, now) {
                warn!(tenant = %tenant_id, session = %session_id, "producer heartbeat stale");
                self.stop(tenant_id, session_id, "producer heartbeat stale")?;
                return Ok(PollOutcome::Failed);
            }
            let _ = tokio::time::timeout(self.config.poll_interval(), self.producer_updated.notified()).await;
        }
    }

    /// Tear the session down: clear it from the video and the tenant index
    /// and delete both heartbeat records. Stopping a missing session is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn stop(&self, tenant_id: &TenantId, session_id: &SessionId, reason: &str) -> CoordinatorResult<()> {
        let stopped = run_transaction(self.store.as_ref(), self.attempts, |txn| {
            Self::stop_in(txn, tenant_id, session_id)
        })?;
        if stopped {
            info!(tenant = %tenant_id, session = %session_id, reason, "tracking stopped");
        }
        Ok(())
    }

    fn stop_in(txn: &mut dyn Transaction, tenant_id: &TenantId, session_id: &SessionId) -> CoordinatorResult<bool> {
        let producer: Option<TrackerProducer> = txn.load(&TrackerProducer::key_for(tenant_id, session_id))?;
        let consumer: Option<TrackerConsumer> = txn.load(&TrackerConsumer::key_for(tenant_id, session_id))?;
        let video_id = match (&producer, &consumer) {
            (Some(p), _) => p.video_id.clone(),
            (None, Some(c)) => c.video_id.clone(),
            (None, None) => return Ok(false),
        };
        if let Some(mut video) = txn.load::<VideoRecord>(&VideoRecord::key_for(tenant_id, &video_id))? {
            if video.tracker_session.as_ref() == Some(session_id) {
                video.tracking_in_progress = false;
                video.tracker_session = None;
                txn.save(&video)?;
            }
        }
        if let Some(mut tenant) = txn.load::<TenantRecord>(&TenantRecord::key_for(tenant_id))? {
            tenant.videos_tracking_now.retain(|v| v != &video_id);
            txn.save(&tenant)?;
        }
        if let Some(p) = &producer {
            txn.remove(p);
        }
        if let Some(c) = &consumer {
            txn.remove(c);
        }
        Ok(true)
    }

    /// Current liveness of a session.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn inspect(&self, tenant_id: &TenantId, session_id: &SessionId) -> CoordinatorResult<SessionState> {
        let producer = self
            .store
            .load::<TrackerProducer>(&TrackerProducer::key_for(tenant_id, session_id))?;
        let consumer = self
            .store
            .load::<TrackerConsumer>(&TrackerConsumer::key_for(tenant_id, session_id))?;
        let now = self.clock.now();
        Ok(match (producer, consumer) {
            (None, None) => SessionState::Absent,
            (Some(_), None) | (None, Some(_)) => SessionState::Stale,
            (Some(p), Some(c)) => {
                if self.is_stale(p.update_time, now) || self.is_stale(c.update_time, now) {
                    SessionState::Stale
                } else if c.stop_requested {
                    SessionState::Terminated
                } else {
                    SessionState::Active
                }
            }
        })
    }

    /// Whether `video_id` has a live session. A stale or orphaned session is
    /// torn down as a side effect and reported as not in progress.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing video.
    pub fn is_tracking_in_progress(&self, tenant_id: &TenantId, video_id: &VideoId) -> CoordinatorResult<bool> {
        let video: VideoRecord = self
            .store
            .load(&VideoRecord::key_for(tenant_id, video_id))?
            .ok_or_else(|| CoordinatorError::NotFound(format!("video {video_id}")))?;
        if !video.tracking_in_progress {
            return Ok(false);
        }
        let Some(session_id) = video.tracker_session else {
            self.clear_orphaned_flag(tenant_id, video_id)?;
            return Ok(false);
        };
        match self.inspect(tenant_id, &session_id)? {
            SessionState::Active | SessionState::Terminated => Ok(true),
            SessionState::Stale => {
                self.stop(tenant_id, &session_id, "stale session found on inspection")?;
                Ok(false)
            }
            SessionState::Absent => {
                self.clear_orphaned_flag(tenant_id, video_id)?;
                Ok(false)
            }
        }
    }

    fn clear_orphaned_flag(&self, tenant_id: &TenantId, video_id: &VideoId) -> CoordinatorResult<()> {
        run_transaction(self.store.as_ref(), self.attempts, |txn| {
            let mut video = load_video(txn, tenant_id, video_id)?;
            video.tracking_in_progress = false;
            video.tracker_session = None;
            txn.save(&video)?;
            if let Some(mut tenant) = txn.load::<TenantRecord>(&TenantRecord::key_for(tenant_id))? {
                tenant.videos_tracking_now.retain(|v| v != video_id);
                txn.save(&tenant)?;
            }
            Ok(())
        })?;
        debug!(tenant = %tenant_id, video = %video_id, "cleared orphaned tracking flag");
        Ok(())
    }

    /// Tear down every session listed in the tenant's tracking index.
    /// Returns how many videos were visited.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing tenant.
    pub fn stop_all_for_tenant(&self, tenant_id: &TenantId) -> CoordinatorResult<usize> {
        let tenant: TenantRecord = self
            .store
            .load(&TenantRecord::key_for(tenant_id))?
            .ok_or_else(|| CoordinatorError::NotFound(format!("tenant {tenant_id}")))?;
        for video_id in &tenant.videos_tracking_now {
            let video: Option<VideoRecord> = self.store.load(&VideoRecord::key_for(tenant_id, video_id))?;
            match video.and_then(|v| v.tracker_session) {
                Some(session_id) => self.stop(tenant_id, &session_id, "tenant-wide stop")?,
                None => self.clear_orphaned_flag(tenant_id, video_id).or_else(|e| match e {
                    CoordinatorError::NotFound(_) => Ok(()),
                    other => Err(other),
                })?,
            }
        }
        Ok(tenant.videos_tracking_now.len())
    }

    fn update_producer(
        &self,
        tenant_id: &TenantId,
        session_id: &SessionId,
        update: impl Fn(&mut TrackerProducer),
    ) -> CoordinatorResult<TrackerProducer> {
        let key = TrackerProducer::key_for(tenant_id, session_id);
        run_transaction(self.store.as_ref(), self.attempts, |txn| {
            let mut producer: TrackerProducer = txn
                .load(&key)?
                .ok_or_else(|| CoordinatorError::NotFound(format!("tracking session {session_id}")))?;
            update(&mut producer);
            txn.save(&producer)?;
            Ok(producer)
        })
    }

    fn update_consumer(
        &self,
        tenant_id: &TenantId,
        session_id: &SessionId,
        update: impl Fn(&mut TrackerConsumer),
    ) -> CoordinatorResult<TrackerConsumer> {
        let key = TrackerConsumer::key_for(tenant_id, session_id);
        run_transaction(self.store.as_ref(), self.attempts, |txn| {
            let mut consumer: TrackerConsumer = txn
                .load(&key)?
                .ok_or_else(|| CoordinatorError::NotFound(format!("tracking session {session_id}")))?;
            update(&mut consumer);
            txn.save(&consumer)?;
            Ok(consumer)
        })
    }
}

fn load_video(txn: &mut dyn Transaction, tenant_id: &TenantId, video_id: &VideoId) -> CoordinatorResult<VideoRecord> {
    txn.load(&VideoRecord::key_for(tenant_id, video_id))?
        .ok_or_else(|| CoordinatorError::NotFound(format!("video {video_id}")))
}

fn load_tenant(txn: &mut dyn Transaction, tenant_id: &TenantId) -> CoordinatorResult<TenantRecord> {
    txn.load(&TenantRecord::key_for(tenant_id))?
        .ok_or_else(|| CoordinatorError::NotFound(format!("tenant {tenant_id}")))
}
