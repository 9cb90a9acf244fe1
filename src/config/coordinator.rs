//! Coordinator configuration structures.

use std::time::Duration;

use anyhow::Context;
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::core::AppResult;

/// Action execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionConfig {
    /// Bucket whose writes trigger action execution.
    pub parameters_bucket: String,
    /// Bucket holding datasets, archives, and model artifacts.
    pub artifacts_bucket: String,
    /// Execution budget granted to one action execution, in seconds.
    pub execution_budget_secs: u64,
    /// Remaining time below which an action re-queues itself, in seconds.
    pub retrigger_margin_secs: u64,
    /// Attempts for a transactional read-modify-write hitting contention.
    pub transaction_attempts: u32,
    /// Entities removed per page by deletion actions.
    pub delete_page_size: usize,
    /// Attempts per key within one administrative sweep.
    pub sweep_max_attempts: u32,
    /// Age after which a dataset archive is deleted, in minutes.
    pub archive_retention_minutes: i64,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            parameters_bucket: "action_parameters".into(),
            artifacts_bucket: "artifacts".into(),
            execution_budget_secs: 500,
            retrigger_margin_secs: 60,
            transaction_attempts: 3,
            delete_page_size: 500,
            sweep_max_attempts: 2,
            archive_retention_minutes: 60,
        }
    }
}

/// Heartbeat settings for interactive sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Age after which a heartbeat is considered dead, in seconds.
    pub staleness_threshold_secs: u64,
    /// Early-exit margin before a poll deadline, in seconds.
    pub poll_margin_secs: u64,
    /// Longest wait between re-reads while polling, in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            staleness_threshold_secs: 120,
            poll_margin_secs: 5,
            poll_interval_ms: 100,
        }
    }
}

/// Quota settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Training minutes granted to a new (or reset) tenant.
    pub initial_training_minutes: i64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            initial_training_minutes: 120,
        }
    }
}

/// Training job settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Silence after which a monitor is restarted, in seconds.
    pub monitor_restart_secs: u64,
    /// Delay between monitor polls of the scheduler, in seconds.
    pub monitor_poll_secs: u64,
    /// Longest stored job error message.
    pub max_error_message_len: usize,
    /// Checkpoint frequency passed to training jobs.
    pub checkpoint_every_n: u32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            monitor_restart_secs: 180,
            monitor_poll_secs: 60,
            max_error_message_len: 1500,
            checkpoint_every_n: 100,
        }
    }
}

/// Shard creation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    /// Shard records written per batch when a parent begins.
    pub create_batch_size: usize,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            create_batch_size: 250,
        }
    }
}

/// Root coordinator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Action execution.
    pub actions: ActionConfig,
    /// Session liveness.
    pub liveness: LivenessConfig,
    /// Quota ledger.
    pub quota: QuotaConfig,
    /// Training lifecycle.
    pub training: TrainingConfig,
    /// Sharded progress.
    pub shards: ShardConfig,
}

fn secs(value: u64) -> TimeDelta {
    TimeDelta::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1_000))
}

impl ActionConfig {
    /// Execution budget granted to one action execution.
    #[must_use]
    pub fn execution_budget(&self) -> TimeDelta {
        secs(self.execution_budget_secs)
    }

    /// Remaining time below which an action re-queues itself.
    #[must_use]
    pub fn retrigger_margin(&self) -> TimeDelta {
        secs(self.retrigger_margin_secs)
    }
}

impl LivenessConfig {
    /// Age after which a heartbeat is dead.
    #[must_use]
    pub fn staleness_threshold(&self) -> TimeDelta {
        secs(self.staleness_threshold_secs)
    }

    /// Early-exit margin before a poll deadline.
    #[must_use]
    pub fn poll_margin(&self) -> TimeDelta {
        secs(self.poll_margin_secs)
    }

    /// Longest wait between re-reads while polling.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl TrainingConfig {
    /// Inactivity after which a monitor is restarted.
    #[must_use]
    pub fn monitor_restart(&self) -> TimeDelta {
        secs(self.monitor_restart_secs)
    }

    /// Sleep between scheduler polls.
    #[must_use]
    pub const fn monitor_poll(&self) -> Duration {
        Duration::from_secs(self.monitor_poll_secs)
    }
}

impl CoordinatorConfig {
    /// Validate all sections.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        let a = &self.actions;
        if a.parameters_bucket.is_empty() || a.artifacts_bucket.is_empty() {
            return Err("bucket names must not be empty".into());
        }
        if a.parameters_bucket == a.artifacts_bucket {
            return Err("parameters_bucket and artifacts_bucket must differ".into());
        }
        if a.execution_budget_secs == 0 {
            return Err("execution_budget_secs must be greater than 0".into());
        }
        if a.retrigger_margin_secs >= a.execution_budget_secs {
            return Err("retrigger_margin_secs must be less than execution_budget_secs".into());
        }
        if a.transaction_attempts == 0 {
            return Err("transaction_attempts must be greater than 0".into());
        }
        if a.delete_page_size == 0 {
            return Err("delete_page_size must be greater than 0".into());
        }
        if a.sweep_max_attempts == 0 {
            return Err("sweep_max_attempts must be greater than 0".into());
        }
        if a.archive_retention_minutes <= 0 {
            return Err("archive_retention_minutes must be greater than 0".into());
        }
        let l = &self.liveness;
        if l.staleness_threshold_secs == 0 {
            return Err("staleness_threshold_secs must be greater than 0".into());
        }
        if l.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than 0".into());
        }
        if self.quota.initial_training_minutes < 0 {
            return Err("initial_training_minutes must not be negative".into());
        }
        let t = &self.training;
        if t.monitor_restart_secs == 0 || t.monitor_poll_secs == 0 {
            return Err("monitor intervals must be greater than 0".into());
        }
        if t.max_error_message_len < 3 {
            return Err("max_error_message_len must be at least 3".into());
        }
        if self.shards.create_batch_size == 0 {
            return Err("create_batch_size must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from defaults overridden by `COORDINATOR_*`
    /// environment variables, loading a `.env` file first when present.
    /// Every field has a variable named after it, e.g.
    /// `COORDINATOR_RETRIGGER_MARGIN_SECS`.
    ///
    /// # Errors
    ///
    /// Fails when a variable does not parse or the result is invalid.
    pub fn from_env() -> AppResult<Self> {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();
        let a = &mut cfg.actions;
        override_string("COORDINATOR_PARAMETERS_BUCKET", &mut a.parameters_bucket);
        override_string("COORDINATOR_ARTIFACTS_BUCKET", &mut a.artifacts_bucket);
        override_parsed("COORDINATOR_EXECUTION_BUDGET_SECS", &mut a.execution_budget_secs)?;
        override_parsed("COORDINATOR_RETRIGGER_MARGIN_SECS", &mut a.retrigger_margin_secs)?;
        override_parsed("COORDINATOR_TRANSACTION_ATTEMPTS", &mut a.transaction_attempts)?;
        override_parsed("COORDINATOR_DELETE_PAGE_SIZE", &mut a.delete_page_size)?;
        override_parsed("COORDINATOR_SWEEP_MAX_ATTEMPTS", &mut a.sweep_max_attempts)?;
        override_parsed("COORDINATOR_ARCHIVE_RETENTION_MINUTES", &mut a.archive_retention_minutes)?;

        let l = &mut cfg.liveness;
        override_parsed("COORDINATOR_STALENESS_THRESHOLD_SECS", &mut l.staleness_threshold_secs)?;
        override_parsed("COORDINATOR_POLL_MARGIN_SECS", &mut l.poll_margin_secs)?;
        override_parsed("COORDINATOR_POLL_INTERVAL_MS", &mut l.poll_interval_ms)?;

        override_parsed(
            "COORDINATOR_INITIAL_TRAINING_MINUTES",
            &mut cfg.quota.initial_training_minutes,
        )?;

        let t = &mut cfg.training;
        override_parsed("COORDINATOR_MONITOR_RESTART_SECS", &mut t.monitor_restart_secs)?;
        override_parsed("COORDINATOR_MONITOR_POLL_SECS", &mut t.monitor_poll_secs)?;
        override_parsed("COORDINATOR_MAX_ERROR_MESSAGE_LEN", &mut t.max_error_message_len)?;
        override_parsed("COORDINATOR_CHECKPOINT_EVERY_N", &mut t.checkpoint_every_n)?;

        override_parsed("COORDINATOR_CREATE_BATCH_SIZE", &mut cfg.shards.create_batch_size)?;
        cfg.validate()
            .map_err(|e| anyhow::anyhow!("configuration invalid: {e}"))?;
        Ok(cfg)
    }
}

fn override_string(var: &str, slot: &mut String) {
    if let Ok(value) = std::env::var(var) {
        *slot = value;
    }
}

fn override_parsed<T>(var: &str, slot: &mut T) -> AppResult<()>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Ok(value) = std::env::var(var) {
        *slot = value
            .parse()
            .with_context(|| format!("{var}={value} is not valid"))?;
    }
    Ok(())
}
