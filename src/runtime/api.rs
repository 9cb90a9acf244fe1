//! API-facing request/response models and thin handlers.
//!
//! Handlers parse caller-supplied identifiers, call into the coordinator, and
//! map [`CoordinatorError`] onto an HTTP-style status.

use serde::{Deserialize, Serialize};

use crate::builders::Coordinator;
use crate::core::{CoordinatorError, DatasetProgress, ModelRecord, PartitionProgress, StartTrainingRequest};
use crate::infra::scheduler::ExternalJobState;
use crate::util::{parse_id_list, DatasetId, ModelId, TenantId, ZipId};

/// Error payload returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// HTTP-style status code.
    pub status: u16,
    /// Human-readable message.
    pub message: String,
}

impl From<CoordinatorError> for ApiError {
    fn from(e: CoordinatorError) -> Self {
        let status = match &e {
            CoordinatorError::NotFound(_) => 404,
            CoordinatorError::Conflict(_) => 409,
            CoordinatorError::QuotaExceeded { .. } => 422,
            CoordinatorError::BadInput(_) => 400,
            CoordinatorError::TransientStore(_) | CoordinatorError::ExternalService(_) => 503,
            CoordinatorError::Retriggered { .. }
            | CoordinatorError::Serialization(_)
            | CoordinatorError::Backend(_) => 500,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

/// Result of an API handler.
pub type ApiResult<T> = Result<T, ApiError>;

/// Health response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    /// Healthy flag.
    pub ok: bool,
}

/// Return a health payload.
#[must_use]
pub const fn health() -> Health {
    Health { ok: true }
}

/// Tenant resolved for a request, with its balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantSummary {
    /// Tenant id.
    pub tenant_id: TenantId,
    /// Remaining training minutes.
    pub remaining_training_minutes: i64,
}

/// Resolve (or create) the tenant named `name`.
///
/// # Errors
///
/// Maps coordinator failures to an [`ApiError`].
pub fn resolve_tenant(coordinator: &Coordinator, name: &str) -> ApiResult<TenantSummary> {
    let tenant_id = coordinator.ledger.ensure_tenant(name)?;
    let remaining_training_minutes = coordinator.ledger.remaining_minutes(&tenant_id)?;
    Ok(TenantSummary {
        tenant_id,
        remaining_training_minutes,
    })
}

/// Training status of one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSummary {
    /// Model id.
    pub model_id: ModelId,
    /// Description.
    pub description: String,
    /// Training sub-job state.
    pub train_state: ExternalJobState,
    /// Evaluation sub-job state.
    pub eval_state: Option<ExternalJobState>,
    /// Stored training error, empty when none.
    pub train_error_message: String,
    /// A monitor was restarted by this request.
    pub monitor_restarted: bool,
}

impl ModelSummary {
    fn from_record(model: &ModelRecord, monitor_restarted: bool) -> Self {
        Self {
            model_id: model.model_id.clone(),
            description: model.description.clone(),
            train_state: model.train.state,
            eval_state: model.eval.as_ref().map(|e| e.state),
            train_error_message: model.train.error_message.clone(),
            monitor_restarted,
        }
    }
}

/// Start training.
///
/// # Errors
///
/// Maps coordinator failures to an [`ApiError`].
pub async fn start_training(
    coordinator: &Coordinator,
    tenant_id: &TenantId,
    request: StartTrainingRequest,
) -> ApiResult<ModelSummary> {
    let model = coordinator.training.start_training(tenant_id, request).await?;
    Ok(ModelSummary::from_record(&model, false))
}

/// Stop training.
///
/// # Errors
///
/// Maps coordinator failures to an [`ApiError`].
pub async fn stop_training(coordinator: &Coordinator, tenant_id: &TenantId, model_id: &str) -> ApiResult<ModelSummary> {
    let model_id = ModelId::parse(model_id)?;
    let model = coordinator.training.stop_training(tenant_id, &model_id).await?;
    Ok(ModelSummary::from_record(&model, false))
}

/// Report a model's status, restarting its monitor when it went quiet.
///
/// # Errors
///
/// Maps coordinator failures to an [`ApiError`].
pub fn model_status(coordinator: &Coordinator, tenant_id: &TenantId, model_id: &str) -> ApiResult<ModelSummary> {
    let model_id = ModelId::parse(model_id)?;
    let restarted = coordinator.training.maybe_restart_monitor(tenant_id, &model_id)?;
    let model = coordinator.training.model(tenant_id, &model_id)?;
    Ok(ModelSummary::from_record(&model, restarted))
}

/// Deletion verdict for a batch of resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    /// Whether deletion was started.
    pub deleted: bool,
    /// Reasons deletion was refused.
    pub messages: Vec<String>,
}

/// Delete datasets given as a JSON array of ids, unless a model uses one.
/// The batch is marked all together or not at all.
///
/// # Errors
///
/// Maps coordinator failures to an [`ApiError`].
pub fn delete_datasets(coordinator: &Coordinator, tenant_id: &TenantId, ids_json: &str) -> ApiResult<DeleteResponse> {
    let ids = parse_id_list(ids_json, DatasetId::parse)?;
    let (ok, messages) = coordinator.datasets.can_delete_datasets(tenant_id, &ids)?;
    if ok {
        coordinator.datasets.delete_datasets(tenant_id, &ids)?;
    }
    Ok(DeleteResponse {
        deleted: ok,
        messages,
    })
}

/// Delete models given as a JSON array of ids, unless another model starts
/// from one. The batch is marked all together or not at all.
///
/// # Errors
///
/// Maps coordinator failures to an [`ApiError`].
pub fn delete_models(coordinator: &Coordinator, tenant_id: &TenantId, ids_json: &str) -> ApiResult<DeleteResponse> {
    let ids = parse_id_list(ids_json, ModelId::parse)?;
    let (ok, messages) = coordinator.training.can_delete_models(tenant_id, &ids)?;
    if ok {
        coordinator.training.delete_models(tenant_id, &ids)?;
    }
    Ok(DeleteResponse {
        deleted: ok,
        messages,
    })
}

/// Production progress of a dataset.
///
/// # Errors
///
/// Maps coordinator failures to an [`ApiError`].
pub fn dataset_progress(coordinator: &Coordinator, tenant_id: &TenantId, dataset_id: &str) -> ApiResult<DatasetProgress> {
    let dataset_id = DatasetId::parse(dataset_id)?;
    Ok(coordinator.datasets.dataset_progress(tenant_id, &dataset_id)?)
}

/// Archive progress with download URLs once complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZipStatus {
    /// Per-partition progress.
    pub partitions: Vec<PartitionProgress>,
    /// Signed URLs, present once every partition is written.
    pub download_urls: Option<Vec<String>>,
}

/// Report archive progress.
///
/// # Errors
///
/// Maps coordinator failures to an [`ApiError`].
pub fn zip_status(coordinator: &Coordinator, tenant_id: &TenantId, zip_id: &str, partition_count: u32) -> ApiResult<ZipStatus> {
    let zip_id = ZipId::parse(zip_id)?;
    let partitions = coordinator
        .datasets
        .zip_progress(tenant_id, &zip_id, partition_count)?;
    let download_urls = coordinator.datasets.zip_download_urls(tenant_id, &zip_id)?;
    Ok(ZipStatus {
        partitions,
        download_urls,
    })
}
