//! Library surface for the Live Component Runtime server.
//!
//! The binary in `main.rs` is a thin wrapper around [`build_router`]; integration
//! tests use the same entry point to drive a real instance over a real socket.

pub mod auth;
pub mod components;
pub mod config;
pub mod connection;
pub mod diff;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod hydration;
pub mod instance;
pub mod lifecycle;
pub mod protocol;
pub mod registry;
pub mod state;
pub mod upload;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Builds the axum router the binary serves. Spawns the connection heartbeat and
/// the idle-instance reaper as background tasks tied to `state`.
pub fn build_router(state: Arc<AppState>) -> Router {
    tokio::spawn(connection::run_heartbeat(
        state.connections.clone(),
        Duration::from_millis(state.config.heartbeat_ms),
    ));
    lifecycle::spawn_reaper(Arc::clone(&state));

    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}
