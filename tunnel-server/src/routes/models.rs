//! Availability snapshot endpoint.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::tunnel::ReachableModel;
use crate::AppState;

/// Response from /v1/models.
#[derive(Debug, Clone, Serialize)]
pub struct ModelsResponse {
    pub models: Vec<ReachableModel>,
}

/// GET /v1/models - every model currently reachable through an agent.
async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    let models = state.router.reachable_models().await;
    Json(ModelsResponse { models })
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/models", get(list_models))
        .with_state(state)
}
