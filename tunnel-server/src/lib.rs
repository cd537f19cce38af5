pub mod config;
pub mod error;
pub mod routes;
pub mod tunnel;

pub use config::Config;
pub use tunnel::{
    DispatchError, InferenceRouter, ModelRegistry, PendingRequests, ReachableModel, TunnelState,
};

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// Tunnel state shared with every agent connection.
    pub tunnel: Arc<TunnelState>,
    /// Router dispatching inference calls over the tunnel.
    pub router: InferenceRouter,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let tunnel = Arc::new(TunnelState::new(config.tunnel.clone()));
        let router = InferenceRouter::new(tunnel.clone());
        Self {
            config,
            tunnel,
            router,
        }
    }
}

/// Build the application router.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` so the
/// WebSocket handler can log peer addresses.
pub fn app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let ws = Router::new()
        .route("/ws/agents", get(tunnel::ws_handler))
        .with_state(state.tunnel.clone());

    Router::new()
        .merge(routes::health::router())
        .nest(
            "/v1",
            Router::new()
                .merge(routes::models::router(state.clone()))
                .merge(routes::dispatch::router(state)),
        )
        .merge(ws)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
