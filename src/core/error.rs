//! Error types for coordinator operations.

use thiserror::Error;

/// Errors produced by coordinator components.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// A referenced tenant, resource, shard, or session does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// A session or admission invariant is already held.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The requested training time exceeds the tenant's remaining balance.
    #[error(
        "quota exceeded: requested {requested} minutes, only {remaining} minutes remain"
    )]
    QuotaExceeded {
        /// Minutes requested.
        requested: i64,
        /// Minutes remaining before the request.
        remaining: i64,
    },
    /// Malformed identifiers or arguments, rejected before any mutation.
    #[error("bad input: {0}")]
    BadInput(String),
    /// Write contention or a store timeout; the enclosing transaction may be re-run.
    #[error("transient store failure: {0}")]
    TransientStore(String),
    /// The external job scheduler rejected or failed a request.
    #[error("external service failure: {0}")]
    ExternalService(String),
    /// The action re-queued itself; the current execution must stop.
    #[error("action {action_id} retriggered")]
    Retriggered {
        /// Action that was re-queued.
        action_id: String,
    },
    /// Encoding or decoding of persisted state failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
}

impl CoordinatorError {
    /// Whether re-running the enclosing transaction may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStore(_))
    }

    /// Whether this error only signals that the action continues in a new execution.
    #[must_use]
    pub const fn is_retrigger(&self) -> bool {
        matches!(self, Self::Retriggered { .. })
    }
}

/// Result type used throughout the coordinator core.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
