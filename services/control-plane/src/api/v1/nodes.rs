//! Node API endpoints.

use axum::{extract::State, routing::get, Json, Router};

use super::ListResponse;
use crate::api::error::ApiError;
use crate::nodes::NodeView;
use crate::state::AppState;

/// Nodes are discovered, never created through the API: /v1/nodes
pub fn routes() -> Router<AppState> {
    Router::new().route("/", get(list_nodes))
}

async fn list_nodes(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<NodeView>>, ApiError> {
    let items = state.nodes().list_nodes().await?;
    Ok(Json(ListResponse { items }))
}
