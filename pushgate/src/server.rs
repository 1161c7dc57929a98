//! HTTP surface: health, push API and the WebSocket upgrade route

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use pushgate_cluster::PushService;
use pushgate_core::models::{DeliveryRequest, SessionKey, WsMessage};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::ws;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PushService>,
}

/// Build the application router
pub fn create_router(service: Arc<PushService>) -> Router {
    let state = AppState { service };

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws::websocket_handler))
        .route("/api/messages", post(publish_message))
        .route("/api/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Basic health check (always returns OK if server is running)
async fn health_check() -> impl IntoResponse {
    "OK"
}

/// Push request body: target keys plus the payload to deliver
#[derive(Debug, Deserialize)]
struct PublishBody {
    session_keys: Vec<SessionKey>,
    message: WsMessage,
}

/// Accept a message for delivery.
///
/// Returns 202 immediately: delivery is best-effort and the caller
/// learns nothing about per-key outcomes.
async fn publish_message(
    State(state): State<AppState>,
    Json(body): Json<PublishBody>,
) -> impl IntoResponse {
    state
        .service
        .publish_message(DeliveryRequest::new(body.session_keys, body.message));
    StatusCode::ACCEPTED
}

/// Node metrics as JSON
async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.metrics())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pushgate_cluster::{NodeConfig, RegistryLimits};

    #[tokio::test]
    async fn test_router_builds_in_single_node_mode() {
        let config = NodeConfig {
            redis_url: String::new(),
            node_id: "test_node".to_string(),
            ..NodeConfig::default()
        };
        let service =
            Arc::new(PushService::new(config, RegistryLimits::default()).unwrap());
        let _router = create_router(service);
    }
}
