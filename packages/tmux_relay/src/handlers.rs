use axum::{
    Json,
    extract::{State, WebSocketUpgrade},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::AppState;
use crate::ws;

/// Relay socket: one per browser, multiplexing every attached target.
pub async fn relay_ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let registry = state.registry.clone();
    let server_config = state.server_config.clone();
    let max_message = server_config.max_frame_bytes as usize;

    ws.max_message_size(max_message)
        .on_upgrade(move |socket| ws::handle_relay_ws(socket, registry, server_config))
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub viewer_links: usize,
    pub push_targets: usize,
    pub uptime_secs: u64,
}

/// Health check endpoint - returns server status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthStatus {
        status: "healthy",
        viewer_links: state.registry.active_targets(),
        push_targets: state.push.as_ref().map_or(0, |p| p.target_count()),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}
