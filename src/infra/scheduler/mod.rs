//! External training-job scheduler backends.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::CoordinatorResult;

pub use memory::InMemoryJobScheduler;

/// State reported by the external scheduler for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExternalJobState {
    /// Not yet known.
    StateUnspecified,
    /// Accepted, waiting for resources.
    Queued,
    /// Resources are being provisioned.
    Preparing,
    /// Executing.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Cancellation in progress.
    Cancelling,
    /// Cancelled.
    Cancelled,
}

impl ExternalJobState {
    /// Whether the job may still consume resources.
    #[must_use]
    pub const fn is_alive(self) -> bool {
        matches!(self, Self::Queued | Self::Preparing | Self::Running)
    }

    /// Whether the job can no longer change state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether the terminal state counts as a failure for quota purposes.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Failed)
    }
}

/// Hardware tier requested for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleTier {
    /// Single accelerator (TPU-style) worker.
    Accelerator,
    /// Single GPU worker.
    Gpu,
}

/// Submission request for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Caller-chosen job id, unique per scheduler project.
    pub job_id: String,
    /// Hardware tier.
    pub scale_tier: ScaleTier,
    /// Folder the job writes checkpoints into.
    pub job_dir: String,
    /// Command-line arguments passed to the training program.
    pub args: Vec<String>,
    /// Wall-clock limit enforced by the scheduler, if any.
    pub max_running_secs: Option<u64>,
}

/// Snapshot of a job as reported by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalJob {
    /// Job id.
    pub job_id: String,
    /// Current state.
    pub state: ExternalJobState,
    /// When the job was accepted.
    pub create_time: Option<DateTime<Utc>>,
    /// When the job began executing.
    pub start_time: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub end_time: Option<DateTime<Utc>>,
    /// Consumed resource units.
    pub consumed_units: f64,
    /// Error text, empty when none.
    pub error_message: String,
}

/// Remote training-job scheduler collaborator.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Submit a job; returns the accepted job snapshot.
    async fn submit(&self, spec: JobSpec) -> CoordinatorResult<ExternalJob>;
    /// Request cancellation.
    async fn cancel(&self, job_id: &str) -> CoordinatorResult<()>;
    /// Fetch the current job snapshot.
    async fn get(&self, job_id: &str) -> CoordinatorResult<ExternalJob>;
}
