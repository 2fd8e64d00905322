//! Workload API endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use corral_id::WorkloadId;
use serde::Serialize;

use super::ListResponse;
use crate::api::error::ApiError;
use crate::state::AppState;
use crate::workloads::{WorkloadConfig, WorkloadError, WorkloadEvent, WorkloadState};

/// Create workload routes: /v1/workloads
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_workloads).post(create_workload))
        .route("/{id}", get(get_workload))
        .route("/{id}/{event}", post(send_event))
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct CreateWorkloadResponse {
    pub id: String,
}

/// GET /v1/workloads
async fn list_workloads(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<WorkloadState>>, ApiError> {
    let items = state.workloads().list().await?;
    Ok(Json(ListResponse { items }))
}

/// POST /v1/workloads
async fn create_workload(
    State(state): State<AppState>,
    Json(config): Json<WorkloadConfig>,
) -> Result<impl IntoResponse, ApiError> {
    let id = state.workloads().create(config).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateWorkloadResponse { id: id.to_string() }),
    ))
}

/// GET /v1/workloads/{id}
async fn get_workload(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkloadState>, ApiError> {
    let id = parse_id(&id)?;
    state
        .workloads()
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("workload {id} not found")))
}

/// POST /v1/workloads/{id}/{event}
///
/// Only `start` and `stop` are accepted from clients; every other event is
/// driven by the control plane itself.
async fn send_event(
    State(state): State<AppState>,
    Path((id, event)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    let event = match event.parse::<WorkloadEvent>() {
        Ok(e @ (WorkloadEvent::Start | WorkloadEvent::Stop)) => e,
        _ => return Err(WorkloadError::UnsupportedEvent(event).into()),
    };
    state.workloads().send_event(id, event).await?;
    Ok(StatusCode::ACCEPTED)
}

fn parse_id(id: &str) -> Result<WorkloadId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::bad_request(format!("invalid workload id {id:?}: {e}")))
}
