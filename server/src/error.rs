//! Error types for beacond.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::registry::ConnectionId;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Authentication error: Cannot join another user's notification room")]
    ChannelAuthorizationDenied { requested: String },

    #[error("authentication required to join {channel}")]
    AnonymousDenied { channel: String },

    #[error("connection not registered: {0}")]
    UnknownConnection(ConnectionId),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("not a member of {channel}")]
    NotAMember { channel: String },

    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("producer key missing or wrong")]
    ProducerUnauthorized,

    #[error("producer endpoints are disabled")]
    ProducerDisabled,

    #[error("deadline source failed: {0}")]
    Source(String),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::ProducerUnauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::ProducerDisabled => StatusCode::FORBIDDEN,
            GatewayError::ChannelAuthorizationDenied { .. } => StatusCode::FORBIDDEN,
            GatewayError::AnonymousDenied { .. } => StatusCode::FORBIDDEN,
            GatewayError::NotAMember { .. } => StatusCode::FORBIDDEN,
            GatewayError::UnknownConnection(_) => StatusCode::NOT_FOUND,
            GatewayError::Protocol(_) | GatewayError::Serialize(_) => StatusCode::BAD_REQUEST,
            GatewayError::Source(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
