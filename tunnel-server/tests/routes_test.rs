//! HTTP surface tests: health, availability snapshot and dispatch mapping.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use tunnel_server::{app, AppState, Config};

fn test_state() -> Arc<AppState> {
    Arc::new(AppState::new(Config {
        http: Default::default(),
        tunnel: Default::default(),
        logging: Default::default(),
    }))
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_route() {
    let response = app(test_state())
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], json!("ok"));
}

#[tokio::test]
async fn test_models_route_empty_registry() {
    let response = app(test_state())
        .oneshot(
            Request::builder()
                .uri("/v1/models")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["models"], json!([]));
}

#[tokio::test]
async fn test_dispatch_route_maps_model_unavailable() {
    let request = Request::builder()
        .method("POST")
        .uri("/v1/dispatch")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::to_vec(&json!({
                "model_name": "missing-model",
                "input": {"prompt": "hi"},
                "timeout_ms": 1000
            }))
            .unwrap(),
        ))
        .unwrap();

    let response = app(test_state()).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], json!("model_unavailable"));
}
