//! Event-trigger entry point.
//!
//! Every write into the action-parameters bucket produces a [`BlobEvent`].
//! The dispatcher turns the event back into params, marks the attempt
//! started, runs the registered handler, and records how the attempt ended.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use tracing::{debug, error, warn};

use super::tokio_spawner::Spawn;
use crate::core::{ActionHandler, ActionKind, ActionParams, ActionProtocol, CoordinatorError, CoordinatorResult};
use crate::infra::blob::BlobEvent;
use crate::util::single_line;

/// How one event was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler completed and the action finished.
    Finished,
    /// The handler re-queued itself; another event will continue it.
    Retriggered,
    /// The handler failed; the attempt was recorded as stopped.
    Failed(String),
    /// Nothing ran: wrong bucket, params already consumed, or no record.
    Ignored,
}

/// Routes action-parameter events to handlers.
pub struct ActionDispatcher {
    protocol: Arc<ActionProtocol>,
    handlers: HashMap<ActionKind, Arc<dyn ActionHandler>>,
}

impl ActionDispatcher {
    /// Create a dispatcher with no handlers.
    #[must_use]
    pub fn new(protocol: Arc<ActionProtocol>) -> Self {
        Self {
            protocol,
            handlers: HashMap::new(),
        }
    }

    /// Route `kind` to `handler`, replacing any previous registration.
    pub fn register(&mut self, kind: ActionKind, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Whether `kind` has a handler.
    #[must_use]
    pub fn handles(&self, kind: ActionKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Handle one object-finalize event.
    ///
    /// # Errors
    ///
    /// Propagates store or blob failures while reading params or recording
    /// the attempt. Handler failures are reported as [`DispatchOutcome::Failed`].
    pub async fn handle_event(&self, bucket: &str, name: &str) -> CoordinatorResult<DispatchOutcome> {
        if bucket != self.protocol.config().parameters_bucket {
            error!(bucket, blob = name, "event from an unexpected bucket");
            return Ok(DispatchOutcome::Ignored);
        }
        let Some(params) = self.protocol.take_params(name)? else {
            debug!(blob = name, "parameters already consumed");
            return Ok(DispatchOutcome::Ignored);
        };
        let time_limit = self.protocol.time_limit();
        self.perform_action(params, time_limit).await
    }

    /// Run one attempt of `params` with deadline `time_limit`.
    ///
    /// # Errors
    ///
    /// Propagates failures recording the attempt.
    pub async fn perform_action(&self, params: ActionParams, time_limit: DateTime<Utc>) -> CoordinatorResult<DispatchOutcome> {
        match self.protocol.on_start(&params) {
            Ok(_) => {}
            Err(CoordinatorError::NotFound(_)) => {
                warn!(action_id = %params.action_id, kind = %params.kind, "action record missing, skipping");
                return Ok(DispatchOutcome::Ignored);
            }
            Err(e) => return Err(e),
        }
        let Some(handler) = self.handlers.get(&params.kind).cloned() else {
            error!(action_id = %params.action_id, kind = %params.kind, "no handler registered");
            self.protocol.on_stop(&params)?;
            return Ok(DispatchOutcome::Failed(format!("no handler for {}", params.kind)));
        };
        match handler.perform(params.clone(), time_limit).await {
            Ok(finished) => {
                self.protocol.on_finish(&finished)?;
                Ok(DispatchOutcome::Finished)
            }
            Err(e) if e.is_retrigger() => {
                self.protocol.on_stop(&params)?;
                Ok(DispatchOutcome::Retriggered)
            }
            Err(e) => {
                let report = single_line(&format!("{e:?}"));
                error!(action_id = %params.action_id, kind = %params.kind, error = %report, "action failed");
                self.protocol.on_stop(&params)?;
                Ok(DispatchOutcome::Failed(e.to_string()))
            }
        }
    }

    /// Handle queued events one at a time until none remain, including those
    /// raised while handling. Returns the outcomes in order.
    ///
    /// # Errors
    ///
    /// Stops at the first failure recording an attempt.
    pub async fn drain(&self, events: &Receiver<BlobEvent>) -> CoordinatorResult<Vec<DispatchOutcome>> {
        let mut outcomes = Vec::new();
        while let Ok(event) = events.try_recv() {
            outcomes.push(self.handle_event(&event.bucket, &event.name).await?);
        }
        Ok(outcomes)
    }

    /// Block on `events`, spawning one task per event, until every sender
    /// is dropped.
    pub fn run_event_loop<S>(self: Arc<Self>, events: &Receiver<BlobEvent>, spawner: &S)
    where
        S: Spawn,
    {
        while let Ok(event) = events.recv() {
            let dispatcher = Arc::clone(&self);
            spawner.spawn(async move {
                if let Err(e) = dispatcher.handle_event(&event.bucket, &event.name).await {
                    error!(blob = %event.name, error = %e, "failed to dispatch event");
                }
            });
        }
        debug!("event channel closed");
    }
}
