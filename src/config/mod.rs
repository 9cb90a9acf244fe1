//! Configuration models for actions, liveness, quota, and training.

pub mod coordinator;

pub use coordinator::{
    ActionConfig, CoordinatorConfig, LivenessConfig, QuotaConfig, ShardConfig, TrainingConfig,
};
