use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

pub mod auth;
pub mod bridge;
pub mod config;
pub mod errors;
pub mod http;
pub mod logging;

use bridge::ToolBridge;

#[derive(Clone)]
pub struct AppState {
    pub api_token: Arc<str>,
    pub bridge: Arc<dyn ToolBridge>,
}

impl AppState {
    pub fn new(api_token: String, bridge: Arc<dyn ToolBridge>) -> Self {
        Self {
            api_token: Arc::<str>::from(api_token),
            bridge,
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    let protected = Router::new()
        .route("/tools", get(http::handlers::list_tools))
        .route("/invoke", post(http::handlers::invoke))
        .route("/restart", post(http::handlers::restart))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer_token,
        ));

    Router::new()
        .route("/health", get(http::handlers::health))
        .route("/.well-known/bridge", get(http::handlers::discovery))
        .merge(protected)
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(state)
}
