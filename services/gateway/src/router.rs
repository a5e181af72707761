//! Axum Router Configuration
//!
//! This module defines the HTTP routing for the gateway: the WebSocket
//! endpoint devices connect to, plus a liveness probe.

use crate::{state::AppState, ws::ws_handler};

use axum::{Router, routing::get};
use std::sync::Arc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .with_state(app_state)
}

async fn healthz() -> &'static str {
    "ok"
}
