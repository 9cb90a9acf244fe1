//! Coordination components and the workflows that drive them.

pub mod action;
pub mod aggregator;
pub mod audit;
pub mod dataset;
pub mod entities;
pub mod error;
pub mod executor;
pub mod liveness;
pub mod quota;
pub mod sweep;
pub mod training;
pub mod video;

pub use action::{ActionKind, ActionParams, ActionProtocol, ActionRecord, ActionState};
pub use aggregator::{
    Aggregate, FinalizeOutcome, GroupTotals, ShardParent, ShardResult, ShardScope, ShardedProgress,
};
pub use audit::{build_audit_event, AuditEvent, AuditSink, InMemoryAuditSink};
pub use dataset::{
    DatasetProgress, DatasetRecord, DatasetService, DatasetZipRecord, FrameLabels, PartitionProgress,
    RecordPlan,
};
pub use entities::{DailyCounters, TenantRecord, VideoRecord};
pub use error::{AppResult, CoordinatorError, CoordinatorResult};
pub use executor::ActionHandler;
pub use liveness::{PollOutcome, Role, SessionState, TrackingSessions};
pub use quota::{QuotaLedger, Settlement};
pub use sweep::AdminSweeps;
pub use training::{ModelRecord, StartTrainingRequest, TrainingLifecycle};
pub use video::VideoCatalog;
