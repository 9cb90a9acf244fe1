//! Scriptable in-memory job scheduler.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{ExternalJob, ExternalJobState, JobScheduler, JobSpec};
use crate::core::{CoordinatorError, CoordinatorResult};

#[derive(Default)]
struct SchedulerState {
    jobs: HashMap<String, ExternalJob>,
    specs: Vec<JobSpec>,
    cancelled: Vec<String>,
    reject_prefixes: HashSet<String>,
    unavailable: bool,
}

/// Job scheduler whose job states are driven by the test or dev harness.
#[derive(Default)]
pub struct InMemoryJobScheduler {
    state: Mutex<SchedulerState>,
}

impl InMemoryJobScheduler {
    /// Create an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject submissions whose job id starts with `prefix`.
    pub fn reject_submissions_with_prefix(&self, prefix: impl Into<String>) {
        self.state.lock().reject_prefixes.insert(prefix.into());
    }

    /// Make every call fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Move a job to `state`, stamping start/end times as appropriate.
    pub fn transition(&self, job_id: &str, state: ExternalJobState, at: DateTime<Utc>) {
        if let Some(job) = self.state.lock().jobs.get_mut(job_id) {
            job.state = state;
            if state == ExternalJobState::Running && job.start_time.is_none() {
                job.start_time = Some(at);
            }
            if matches!(
                state,
                ExternalJobState::Succeeded | ExternalJobState::Failed | ExternalJobState::Cancelled
            ) {
                job.end_time = Some(at);
            }
        }
    }

    /// Attach an error message and consumed units to a job.
    pub fn set_outcome(&self, job_id: &str, error_message: &str, consumed_units: f64) {
        if let Some(job) = self.state.lock().jobs.get_mut(job_id) {
            job.error_message = error_message.to_string();
            job.consumed_units = consumed_units;
        }
    }

    /// Specs submitted so far, in order.
    #[must_use]
    pub fn submitted(&self) -> Vec<JobSpec> {
        self.state.lock().specs.clone()
    }

    /// Job ids that received a cancel request, in order.
    #[must_use]
    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().cancelled.clone()
    }
}

fn unavailable() -> CoordinatorError {
    CoordinatorError::ExternalService("scheduler unavailable".into())
}

#[async_trait]
impl JobScheduler for InMemoryJobScheduler {
    async fn submit(&self, spec: JobSpec) -> CoordinatorResult<ExternalJob> {
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(unavailable());
        }
        if state.reject_prefixes.iter().any(|p| spec.job_id.starts_with(p.as_str())) {
            return Err(CoordinatorError::ExternalService(format!(
                "job {} rejected",
                spec.job_id
            )));
        }
        if state.jobs.contains_key(&spec.job_id) {
            return Err(CoordinatorError::ExternalService(format!(
                "job {} already exists",
                spec.job_id
            )));
        }
        let job = ExternalJob {
            job_id: spec.job_id.clone(),
            state: ExternalJobState::Queued,
            create_time: Some(Utc::now()),
            start_time: None,
            end_time: None,
            consumed_units: 0.0,
            error_message: String::new(),
        };
        state.jobs.insert(spec.job_id.clone(), job.clone());
        state.specs.push(spec);
        Ok(job)
    }

    async fn cancel(&self, job_id: &str) -> CoordinatorResult<()> {
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(unavailable());
        }
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| CoordinatorError::ExternalService(format!("job {job_id} unknown")))?;
        if matches!(
            job.state,
            ExternalJobState::Queued | ExternalJobState::Preparing | ExternalJobState::Running
        ) {
            job.state = ExternalJobState::Cancelling;
        }
        state.cancelled.push(job_id.to_string());
        Ok(())
    }

    async fn get(&self, job_id: &str) -> CoordinatorResult<ExternalJob> {
        let state = self.state.lock();
        if state.unavailable {
            return Err(unavailable());
        }
        state
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::ExternalService(format!("job {job_id} unknown")))
    }
}
