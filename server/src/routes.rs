//! HTTP surface: the WebSocket endpoint, a liveness probe, and the producer
//! endpoints the CRUD layer calls when it runs out of process.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, COOKIE};
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::GatewayError;
use crate::state::AppState;
use crate::types::ServerMessage;
use crate::ws;

/// Header carrying the shared producer key.
pub const PRODUCER_KEY_HEADER: &str = "x-producer-key";

/// Response of the producer endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// Whether the target channel had at least one live connection.
    pub delivered: bool,
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.cors_origin);
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/healthz", get(healthz))
        .route("/api/notify/users/{user_id}", post(notify_user))
        .route("/api/notify/workspaces/{workspace_id}", post(notify_workspace))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origin: &str) -> CorsLayer {
    match HeaderValue::from_str(origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_credentials(true)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([CONTENT_TYPE, AUTHORIZATION, COOKIE]),
        Err(e) => {
            warn!(origin, "invalid CORS origin, cross-origin requests disabled: {e}");
            CorsLayer::new()
        }
    }
}

/// Liveness probe.
async fn healthz() -> &'static str {
    "ok"
}

fn authorize_producer(state: &AppState, headers: &HeaderMap) -> Result<(), GatewayError> {
    let expected = state
        .config
        .producer_key
        .as_deref()
        .ok_or(GatewayError::ProducerDisabled)?;
    let presented = headers
        .get(PRODUCER_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    if presented == Some(expected) {
        Ok(())
    } else {
        Err(GatewayError::ProducerUnauthorized)
    }
}

/// POST /api/notify/users/{user_id}: body is the notification payload.
async fn notify_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<JsonValue>,
) -> Result<Json<DeliveryReceipt>, GatewayError> {
    authorize_producer(&state, &headers)?;
    let delivered = state.gateway.notify(&user_id, &payload);
    Ok(Json(DeliveryReceipt { delivered }))
}

/// POST /api/notify/workspaces/{workspace_id}: body is an outbound event.
async fn notify_workspace(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
    headers: HeaderMap,
    Json(msg): Json<ServerMessage>,
) -> Result<Json<DeliveryReceipt>, GatewayError> {
    authorize_producer(&state, &headers)?;
    let delivered = state.gateway.broadcast_to_workspace(&workspace_id, &msg);
    Ok(Json(DeliveryReceipt { delivered }))
}
