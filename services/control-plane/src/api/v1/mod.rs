//! API v1 routes.

mod nodes;
mod resources;
mod volumes;
mod workloads;

use axum::Router;
use serde::Serialize;

use crate::state::AppState;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/workloads", workloads::routes())
        .nest("/nodes", nodes::routes())
        .nest("/volumes", volumes::routes())
        .nest("/resources", resources::routes())
}

/// Envelope for list endpoints.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ListResponse<T> {
    pub items: Vec<T>,
}
