//! Dispatch endpoint exposing the router entry point over HTTP.

use std::sync::Arc;

use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};

use crate::tunnel::DispatchError;
use crate::AppState;

/// Request body for /v1/dispatch.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchRequest {
    pub model_name: String,
    /// Opaque task payload forwarded to the agent's local runtime.
    pub input: serde_json::Value,
    /// Optional per-request deadline; falls back to the configured default.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Response body for /v1/dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchResponse {
    pub model_name: String,
    pub result: serde_json::Value,
}

/// POST /v1/dispatch - route one inference call through the tunnel.
async fn dispatch(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DispatchRequest>,
) -> Result<Json<DispatchResponse>, DispatchError> {
    let timeout_ms = request
        .timeout_ms
        .unwrap_or(state.config.tunnel.default_dispatch_timeout_ms);
    let result = state
        .router
        .dispatch_inference(&request.model_name, request.input, timeout_ms)
        .await?;
    Ok(Json(DispatchResponse {
        model_name: request.model_name,
        result,
    }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/dispatch", post(dispatch))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dispatch_request_deserialization() {
        let request: DispatchRequest = serde_json::from_value(json!({
            "model_name": "alpha-7b",
            "input": {"prompt": "hi"}
        }))
        .unwrap();
        assert_eq!(request.model_name, "alpha-7b");
        assert!(request.timeout_ms.is_none());

        let request: DispatchRequest = serde_json::from_value(json!({
            "model_name": "alpha-7b",
            "input": "raw",
            "timeout_ms": 2500
        }))
        .unwrap();
        assert_eq!(request.timeout_ms, Some(2500));
    }
}
