//! Volume API endpoints.

use axum::{extract::State, routing::get, Json, Router};

use super::ListResponse;
use crate::api::error::ApiError;
use crate::state::AppState;
use crate::volumes::VolumeModel;

pub fn routes() -> Router<AppState> {
    Router::new().route("/", get(list_volumes))
}

/// GET /v1/volumes
async fn list_volumes(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<VolumeModel>>, ApiError> {
    let items = state.volumes().list().await?;
    Ok(Json(ListResponse { items }))
}
