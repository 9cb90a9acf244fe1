//! Builder that wires the coordinator from configuration and collaborators.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::config::CoordinatorConfig;
use crate::core::{
    ActionKind, ActionProtocol, AdminSweeps, AuditSink, CoordinatorError, CoordinatorResult,
    DatasetService, QuotaLedger, ShardedProgress, TrackingSessions, TrainingLifecycle, VideoCatalog,
};
use crate::infra::{BlobStore, EntityStore, JobScheduler};
use crate::runtime::ActionDispatcher;
use crate::util::Clock;

/// External collaborators the coordinator runs on.
#[derive(Clone)]
pub struct Collaborators {
    /// Transactional entity store.
    pub store: Arc<dyn EntityStore>,
    /// Blob storage and event substrate.
    pub blobs: Arc<dyn BlobStore>,
    /// External training-job scheduler.
    pub scheduler: Arc<dyn JobScheduler>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// Every coordination service, wired together.
pub struct Coordinator {
    /// Validated configuration.
    pub config: CoordinatorConfig,
    /// Action protocol.
    pub actions: Arc<ActionProtocol>,
    /// Quota ledger.
    pub ledger: Arc<QuotaLedger>,
    /// Sharded progress aggregator.
    pub shards: Arc<ShardedProgress>,
    /// Tracking sessions.
    pub sessions: Arc<TrackingSessions>,
    /// Video catalog.
    pub videos: Arc<VideoCatalog>,
    /// Dataset workflows.
    pub datasets: Arc<DatasetService>,
    /// Training lifecycle.
    pub training: Arc<TrainingLifecycle>,
    /// Administrative sweeps.
    pub sweeps: Arc<AdminSweeps>,
    /// Event entry point with every action kind registered.
    pub dispatcher: Arc<ActionDispatcher>,
}

/// Validate `config` and build a [`Coordinator`], registering a handler for
/// every action kind.
///
/// # Errors
///
/// Returns `BadInput` when the configuration is invalid.
pub fn build_coordinator(
    config: CoordinatorConfig,
    collaborators: Collaborators,
    audit: Option<Arc<Mutex<dyn AuditSink>>>,
) -> CoordinatorResult<Coordinator> {
    config
        .validate()
        .map_err(|e| CoordinatorError::BadInput(format!("config invalid: {e}")))?;
    let Collaborators {
        store,
        blobs,
        scheduler,
        clock,
    } = collaborators;
    let attempts = config.actions.transaction_attempts;

    let mut protocol = ActionProtocol::new(
        Arc::clone(&store),
        Arc::clone(&blobs),
        Arc::clone(&clock),
        config.actions.clone(),
    );
    if let Some(sink) = audit {
        protocol = protocol.with_audit(sink);
    }
    let actions = Arc::new(protocol);
    let ledger = Arc::new(QuotaLedger::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        config.quota.clone(),
        attempts,
    ));
    let shards = Arc::new(ShardedProgress::new(
        Arc::clone(&store),
        Arc::clone(&actions),
        Arc::clone(&clock),
        config.shards.clone(),
    ));
    let sessions = Arc::new(TrackingSessions::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        config.liveness.clone(),
        attempts,
    ));
    let videos = Arc::new(VideoCatalog::new(
        Arc::clone(&store),
        Arc::clone(&blobs),
        Arc::clone(&clock),
        Arc::clone(&actions),
        Arc::clone(&ledger),
        Arc::clone(&sessions),
    ));
    let datasets = Arc::new(DatasetService::new(
        Arc::clone(&store),
        Arc::clone(&blobs),
        Arc::clone(&clock),
        Arc::clone(&actions),
        Arc::clone(&shards),
        Arc::clone(&ledger),
    ));
    let training = Arc::new(TrainingLifecycle::new(
        Arc::clone(&store),
        Arc::clone(&blobs),
        scheduler,
        Arc::clone(&clock),
        Arc::clone(&actions),
        Arc::clone(&ledger),
        config.training.clone(),
    ));
    let sweeps = Arc::new(AdminSweeps::new(
        Arc::clone(&store),
        Arc::clone(&actions),
        config.quota.initial_training_minutes,
    ));

    let mut dispatcher = ActionDispatcher::new(Arc::clone(&actions));
    for kind in ActionKind::ALL {
        match kind {
            ActionKind::ProduceDatasetRecord
            | ActionKind::DeleteDataset
            | ActionKind::ZipDataset
            | ActionKind::ZipDatasetPartition
            | ActionKind::DeleteDatasetZip => dispatcher.register(kind, datasets.clone()),
            ActionKind::DeleteShardProgress => dispatcher.register(kind, shards.clone()),
            ActionKind::MonitorTraining | ActionKind::DeleteModel => {
                dispatcher.register(kind, training.clone());
            }
            ActionKind::DeleteVideo => dispatcher.register(kind, videos.clone()),
            ActionKind::ResetRemainingTrainingMinutes
            | ActionKind::IncrementRemainingTrainingMinutes
            | ActionKind::ResetTenants
            | ActionKind::SaveSeasonSnapshot => dispatcher.register(kind, sweeps.clone()),
        }
    }
    info!(kinds = ActionKind::ALL.len(), "coordinator built");

    Ok(Coordinator {
        config,
        actions,
        ledger,
        shards,
        sessions,
        videos,
        datasets,
        training,
        sweeps,
        dispatcher: Arc::new(dispatcher),
    })
}
