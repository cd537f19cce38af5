//! HTTP mapping for dispatch errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::tunnel::DispatchError;

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            DispatchError::ModelUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "model_unavailable")
            }
            DispatchError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            DispatchError::TunnelDisconnected => (StatusCode::BAD_GATEWAY, "tunnel_disconnected"),
            DispatchError::LocalRuntime { .. } => (StatusCode::BAD_GATEWAY, "local_runtime_error"),
        };

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}
