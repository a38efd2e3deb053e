//! HTTP surface: router construction and shared state.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api;
use crate::engine::NotificationEngine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<NotificationEngine>,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/stats", get(api::stats))
        .route("/metrics", get(api::metrics))
        .route("/api/notifications", post(api::send_notification))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
