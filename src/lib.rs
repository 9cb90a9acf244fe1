//! # Training Coordinator
//!
//! A coordination layer for long-running, externally executed work on top of a
//! transactional entity store, under a per-tenant training-minute quota.
//!
//! The hard part is not any single operation but keeping state consistent
//! while work is split across many short executions, any of which may be
//! retried, duplicated, or cut off by its time budget.
//!
//! ## Components
//!
//! - **Action protocol** ([`core::action`]): resumable units of work triggered by
//!   writing their params into a blob bucket. Bodies check their deadline at each
//!   checkpoint and re-queue themselves before they run out of time.
//! - **Sharded progress** ([`core::aggregator`]): one progress record and one
//!   result record per shard; whichever shard completes last finalizes the
//!   parent exactly once.
//! - **Liveness** ([`core::liveness`]): heartbeat records for both sides of an
//!   interactive tracking session; a stale side tears the session down.
//! - **Quota ledger** ([`core::quota`]): transactional reserve, release, and
//!   one-time settlement of training minutes.
//! - **Training lifecycle** ([`core::training`]): submission with compensation,
//!   job-state mirroring, and a restartable monitor.
//!
//! ## Wiring
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use training_coordinator::builders::{build_coordinator, Collaborators};
//! use training_coordinator::config::CoordinatorConfig;
//! use training_coordinator::infra::{InMemoryBlobStore, InMemoryJobScheduler, InMemoryStore};
//! use training_coordinator::util::SystemClock;
//!
//! let blobs = Arc::new(InMemoryBlobStore::new());
//! let (tx, rx) = crossbeam_channel::unbounded();
//! blobs.watch("action_parameters", tx);
//!
//! let coordinator = build_coordinator(
//!     CoordinatorConfig::default(),
//!     Collaborators {
//!         store: Arc::new(InMemoryStore::new()),
//!         blobs,
//!         scheduler: Arc::new(InMemoryJobScheduler::new()),
//!         clock: Arc::new(SystemClock),
//!     },
//!     None,
//! )?;
//!
//! let tenant = coordinator.ledger.ensure_tenant("robotics-team")?;
//! coordinator.dispatcher.drain(&rx).await?;
//! ```
//!
//! For complete flows, see the integration tests under `tests/`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Coordination components and workflows.
pub mod core;
/// Configuration models for actions, liveness, quota, and training.
pub mod config;
/// Builders to construct the coordinator from configuration.
pub mod builders;
/// Collaborator traits and in-memory adapters.
pub mod infra;
/// Event entry point, spawner, and request/response surface.
pub mod runtime;
/// Shared utilities.
pub mod util;
