//! Resource accounting endpoints.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};

use super::ListResponse;
use crate::api::error::ApiError;
use crate::resources::Provider;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/{resource_type}", get(list_providers))
}

/// GET /v1/resources/{type}
///
/// Every provider of the type with its users, ordered by provider id.
async fn list_providers(
    State(state): State<AppState>,
    Path(resource_type): Path<String>,
) -> Result<Json<ListResponse<Provider>>, ApiError> {
    let providers = state.resources().providers(&resource_type).await?;
    Ok(Json(ListResponse {
        items: providers.into_values().collect(),
    }))
}
