//! HTTP handlers for the REST API
//!
//! All mutating endpoints record the desired-state change and return
//! immediately; convergence happens out-of-band in the loop. Clients poll
//! `/v1/state/datasets` to observe completion.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::instrument;

use crate::error::Error;
use crate::model::DatasetId;

use super::dto::{
    DatasetCreateRequest, DatasetListResponse, DatasetResponse, DatasetStateListResponse,
    DatasetStateResponse, DatasetUpdateRequest, ErrorResponse, HealthResponse,
};
use super::ApiState;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(err: Error) -> ApiError {
    match err {
        Error::DatasetNotFound(id) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                "not_found",
                &format!("dataset {} not found", id),
            )),
        ),
        Error::Config(message) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("invalid_configuration", &message)),
        ),
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new("internal", &other.to_string())),
        ),
    }
}

/// Health check endpoint
#[instrument(skip(state))]
pub async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        phase: state.convergence.phase().to_string(),
    })
}

/// Create a dataset; 201 with the stored representation including the
/// generated dataset_id
#[instrument(skip(state, body))]
pub async fn create_dataset(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<DatasetCreateRequest>,
) -> Result<(StatusCode, Json<DatasetResponse>), ApiError> {
    let dataset = state
        .store
        .create_dataset(body.primary, body.maximum_size, body.metadata)
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(dataset.into())))
}

/// Update a dataset's primary (move) or size (resize)
#[instrument(skip(state, body), fields(dataset_id = %dataset_id))]
pub async fn update_dataset(
    State(state): State<Arc<ApiState>>,
    Path(dataset_id): Path<DatasetId>,
    Json(body): Json<DatasetUpdateRequest>,
) -> Result<Json<DatasetResponse>, ApiError> {
    let dataset = state
        .store
        .update_dataset(dataset_id, body.primary, body.maximum_size)
        .map_err(error_response)?;
    Ok(Json(dataset.into()))
}

/// Mark a dataset for removal; actual deletion is asynchronous
#[instrument(skip(state), fields(dataset_id = %dataset_id))]
pub async fn delete_dataset(
    State(state): State<Arc<ApiState>>,
    Path(dataset_id): Path<DatasetId>,
) -> Result<Json<DatasetResponse>, ApiError> {
    let dataset = state
        .store
        .delete_dataset(dataset_id)
        .map_err(error_response)?;
    Ok(Json(dataset.into()))
}

/// Desired dataset configuration listing
#[instrument(skip(state))]
pub async fn list_configured_datasets(
    State(state): State<Arc<ApiState>>,
) -> Json<DatasetListResponse> {
    let config = state.store.current();
    let items: Vec<DatasetResponse> = config
        .datasets
        .values()
        .cloned()
        .map(DatasetResponse::from)
        .collect();
    let total = items.len();
    Json(DatasetListResponse { items, total })
}

/// Actual dataset state listing, from the most recent snapshot
#[instrument(skip(state))]
pub async fn list_dataset_state(
    State(state): State<Arc<ApiState>>,
) -> Json<DatasetStateListResponse> {
    let snapshot = state.observer.current();
    let mut items = Vec::new();
    for (node, node_state) in &snapshot.nodes {
        for attached in node_state.datasets.values() {
            items.push(DatasetStateResponse {
                dataset_id: attached.dataset_id,
                node: *node,
                maximum_size: attached.maximum_size,
                metadata: attached.metadata.clone(),
            });
        }
    }
    items.sort_by_key(|item| item.dataset_id);
    let total = items.len();
    Json(DatasetStateListResponse {
        items,
        total,
        observed_at: snapshot.observed_at.to_rfc3339(),
    })
}
