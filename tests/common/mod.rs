//! Shared harness for integration tests: a coordinator over in-memory
//! collaborators, a manual clock, and an audit sink.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use training_coordinator::builders::{build_coordinator, Collaborators, Coordinator};
use training_coordinator::config::CoordinatorConfig;
use training_coordinator::core::{FrameLabels, InMemoryAuditSink, RecordPlan};
use training_coordinator::infra::{BlobEvent, InMemoryBlobStore, InMemoryJobScheduler, InMemoryStore};
use training_coordinator::runtime::DispatchOutcome;
use training_coordinator::util::{init_tracing, DatasetId, ManualClock, TenantId, VideoId};

// ============================================================================
// HARNESS
// ============================================================================

pub struct Harness {
    pub coordinator: Coordinator,
    pub store: Arc<InMemoryStore>,
    pub blobs: Arc<InMemoryBlobStore>,
    pub scheduler: Arc<InMemoryJobScheduler>,
    pub clock: Arc<ManualClock>,
    pub audit: Arc<Mutex<InMemoryAuditSink>>,
    pub events: Receiver<BlobEvent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(CoordinatorConfig::default())
    }

    pub fn with_config(config: CoordinatorConfig) -> Self {
        init_tracing();
        let store = Arc::new(InMemoryStore::new());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let scheduler = Arc::new(InMemoryJobScheduler::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
        ));
        let audit = Arc::new(Mutex::new(InMemoryAuditSink::new(1_000)));
        let (tx, events) = crossbeam_channel::unbounded();
        blobs.watch(config.actions.parameters_bucket.clone(), tx);

        let coordinator = build_coordinator(
            config,
            Collaborators {
                store: store.clone(),
                blobs: blobs.clone(),
                scheduler: scheduler.clone(),
                clock: clock.clone(),
            },
            Some(audit.clone()),
        )
        .expect("valid config");

        Self {
            coordinator,
            store,
            blobs,
            scheduler,
            clock,
            audit,
            events,
        }
    }

    /// Handle every queued action event, including ones raised on the way.
    pub async fn drain(&self) -> Vec<DispatchOutcome> {
        self.coordinator
            .dispatcher
            .drain(&self.events)
            .await
            .expect("dispatch")
    }

    pub fn tenant(&self, name: &str) -> TenantId {
        self.coordinator.ledger.ensure_tenant(name).expect("tenant")
    }

    pub fn labeled_video(&self, tenant: &TenantId, frames: u32, labeled: u32) -> VideoId {
        let video = self
            .coordinator
            .videos
            .create_video(tenant, "parking lot", frames)
            .expect("video");
        self.coordinator
            .videos
            .set_labeled_frame_count(tenant, &video, labeled)
            .expect("labels");
        video
    }

    /// Produce a dataset from `plans` and run its actions to completion.
    pub async fn completed_dataset(
        &self,
        tenant: &TenantId,
        description: &str,
        labels: &[&str],
        plans: Vec<RecordPlan>,
    ) -> DatasetId {
        let video = plans
            .iter()
            .flat_map(|p| p.frames.iter())
            .map(|f| f.video_id.clone())
            .next()
            .unwrap_or_else(|| self.labeled_video(tenant, 10, 1));
        let dataset = self
            .coordinator
            .datasets
            .prepare_dataset_production(tenant, description, &[video], 20.0)
            .expect("prepare");
        let labels: Vec<String> = labels.iter().map(ToString::to_string).collect();
        self.coordinator
            .datasets
            .start_dataset_production(tenant, &dataset, &labels, plans)
            .expect("start");
        self.drain().await;
        dataset
    }
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

pub fn frame(video: &VideoId, frame_number: u32, labels: &[&str]) -> FrameLabels {
    let bboxes_text = labels
        .iter()
        .map(|l| format!("10,10,50,50,{l}"))
        .collect::<Vec<_>>()
        .join("\n");
    FrameLabels {
        video_id: video.clone(),
        frame_number,
        bboxes_text,
    }
}

pub fn plan(is_eval: bool, frames: Vec<FrameLabels>) -> RecordPlan {
    RecordPlan { is_eval, frames }
}

/// Two training records and one evaluation record over `video`.
pub fn bird_plans(video: &VideoId) -> Vec<RecordPlan> {
    vec![
        plan(false, vec![frame(video, 0, &["bird"]), frame(video, 1, &["bird", "cat"])]),
        plan(false, vec![frame(video, 2, &[])]),
        plan(true, vec![frame(video, 3, &["cat"])]),
    ]
}

pub fn count_finished(outcomes: &[DispatchOutcome]) -> usize {
    outcomes
        .iter()
        .filter(|o| **o == DispatchOutcome::Finished)
        .count()
}
