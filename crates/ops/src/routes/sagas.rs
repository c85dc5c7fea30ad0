//! Saga lookup and manual compensation endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::{DateTime, Utc};
use saga::{CompensationRegistry, SagaInstance, SagaOrchestrator, SagaStatus, StepRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ApiError;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub orchestrator: SagaOrchestrator,
    pub registry: Arc<CompensationRegistry>,
}

// -- Request types --

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<SagaStatus>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SagaTypeQuery {
    pub saga_type: Option<String>,
}

// -- Response types --

#[derive(Serialize)]
pub struct SagaResponse {
    pub saga_id: String,
    pub business_id: String,
    pub saga_type: String,
    pub status: SagaStatus,
    pub failed_step: Option<String>,
    pub last_error: Option<String>,
    pub dead_lettered: bool,
    pub metadata: Map<String, Value>,
    pub steps: Vec<StepRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<SagaInstance> for SagaResponse {
    fn from(saga: SagaInstance) -> Self {
        Self {
            saga_id: saga.id().to_string(),
            business_id: saga.business_id().to_string(),
            saga_type: saga.saga_type().to_string(),
            status: saga.status(),
            failed_step: saga.failed_step().map(str::to_string),
            last_error: saga.last_error().map(str::to_string),
            dead_lettered: saga.is_dead_lettered(),
            metadata: saga.metadata().clone(),
            steps: saga.steps().to_vec(),
            created_at: saga.created_at(),
            updated_at: saga.updated_at(),
        }
    }
}

#[derive(Serialize)]
pub struct SagaListResponse {
    pub status: SagaStatus,
    pub sagas: Vec<SagaResponse>,
}

#[derive(Serialize)]
pub struct CompensateResponse {
    pub saga_id: String,
    pub business_id: String,
    pub saga_type: String,
    pub status: SagaStatus,
}

// -- Handlers --

/// GET /sagas?status=&limit=: newest sagas in a status, `compensation_failed` by default.
#[tracing::instrument(skip(state))]
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<SagaListResponse>, ApiError> {
    let status = query.status.unwrap_or(SagaStatus::CompensationFailed);
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    if limit == 0 || limit > MAX_LIST_LIMIT {
        return Err(ApiError::BadRequest(format!(
            "limit must be between 1 and {MAX_LIST_LIMIT}"
        )));
    }

    let sagas = state
        .orchestrator
        .list_sagas_by_status(status, limit)
        .await?
        .into_iter()
        .map(SagaResponse::from)
        .collect();

    Ok(Json(SagaListResponse { status, sagas }))
}

/// GET /sagas/{business_id}?saga_type=: latest saga for a business ID.
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(business_id): Path<String>,
    Query(query): Query<SagaTypeQuery>,
) -> Result<Json<SagaResponse>, ApiError> {
    let saga = load(&state.orchestrator, &business_id, query.saga_type.as_deref()).await?;
    Ok(Json(saga.into()))
}

/// POST /sagas/{business_id}/compensate?saga_type=: operator-triggered unwind.
///
/// Works on completed sagas and retries `compensation_failed` ones; steps
/// already compensated are skipped.
#[tracing::instrument(skip(state))]
pub async fn compensate(
    State(state): State<Arc<AppState>>,
    Path(business_id): Path<String>,
    Query(query): Query<SagaTypeQuery>,
) -> Result<Json<CompensateResponse>, ApiError> {
    let mut saga = load(&state.orchestrator, &business_id, query.saga_type.as_deref()).await?;
    let steps = state.registry.steps_for(&saga)?;

    tracing::info!(
        saga_id = %saga.id(),
        saga_type = %saga.saga_type(),
        status = %saga.status(),
        "manual compensation requested"
    );
    metrics::counter!("saga_manual_compensations_total", "saga_type" => saga.saga_type().to_string())
        .increment(1);
    let status = state.orchestrator.compensate(&mut saga, &steps).await?;

    Ok(Json(CompensateResponse {
        saga_id: saga.id().to_string(),
        business_id: saga.business_id().to_string(),
        saga_type: saga.saga_type().to_string(),
        status,
    }))
}

async fn load(
    orchestrator: &SagaOrchestrator,
    business_id: &str,
    saga_type: Option<&str>,
) -> Result<SagaInstance, ApiError> {
    match saga_type {
        Some(saga_type) => orchestrator
            .find_saga(business_id, saga_type)
            .await?
            .ok_or_else(|| {
                ApiError::NotFound(format!("no {saga_type} saga for '{business_id}'"))
            }),
        None => Ok(orchestrator.get_saga_by_business_id(business_id).await?),
    }
}
