//! Action handler trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::action::ActionParams;
use super::error::CoordinatorResult;

/// Body of one action kind.
///
/// The dispatcher hands each execution the parameter bag by value together
/// with its deadline. Long-running bodies call
/// [`ActionProtocol::retrigger_if_necessary`](super::action::ActionProtocol::retrigger_if_necessary)
/// at every checkpoint and propagate its `Retriggered` error with `?`, so the
/// continuation resumes from the persisted params instead of in-memory state.
/// Every body must tolerate re-running any prefix of its work.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use training_coordinator::core::{ActionHandler, ActionParams, CoordinatorResult};
///
/// struct Noop;
///
/// #[async_trait]
/// impl ActionHandler for Noop {
///     async fn perform(&self, params: ActionParams, _limit: DateTime<Utc>) -> CoordinatorResult<ActionParams> {
///         Ok(params)
///     }
/// }
/// ```
#[async_trait]
pub trait ActionHandler: Send + Sync + 'static {
    /// Run the action until it finishes, fails, or retriggers itself.
    ///
    /// Returns the final params, which administrative actions keep on their
    /// record.
    async fn perform(&self, params: ActionParams, time_limit: DateTime<Utc>) -> CoordinatorResult<ActionParams>;
}
