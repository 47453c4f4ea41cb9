//! Minimal ambient HTTP surface: `/health` and `/status`. The full
//! OpenAPI/HTTP API is out of scope (spec.md §1 Non-goals); these two
//! routes exist only so operators and tests have something to poll
//! without standing up the cluster WebSocket handshake. Grounded on
//! `convex_server::routes::create_router`'s `/health` route, trimmed
//! of the CRUD surface.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use fish_cluster::hub::Hub;
use fish_storage::storage::Storage;
use serde_json::json;

/// State shared by the ambient `/health`,`/status` routes.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<Storage>,
    pub hub: Hub,
    pub node_name: String,
}

/// Build the ambient router, meant to be merged with
/// [`fish_cluster::server::router`] under the same `axum::serve` call.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let applications = state.storage.applications.count().unwrap_or(0);
    let nodes = state.storage.nodes.count().unwrap_or(0);
    Json(json!({
        "node_name": state.node_name,
        "backend": state.storage.backend_name(),
        "peers": state.hub.peer_count(),
        "applications": applications,
        "nodes": nodes,
    }))
}
