//! Engine error taxonomy and HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::store::StoreError;
use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue is full ({depth} items)")]
    QueueFull { depth: usize },

    #[error("Circuit breaker is open")]
    CircuitOpen,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            EngineError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
            EngineError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR"),
            EngineError::QueueFull { .. } => (StatusCode::SERVICE_UNAVAILABLE, "QUEUE_FULL"),
            EngineError::CircuitOpen => (StatusCode::SERVICE_UNAVAILABLE, "CIRCUIT_OPEN"),
            EngineError::Transport(_) => (StatusCode::BAD_GATEWAY, "TRANSPORT_ERROR"),
            EngineError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            EngineError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        if status.is_server_error() {
            tracing::error!(code = code, error = %self, "Request failed");
        } else {
            tracing::warn!(code = code, error = %self, "Request rejected");
        }

        let body = json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        });

        (status, Json(body)).into_response()
    }
}
