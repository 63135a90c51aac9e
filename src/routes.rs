use axum::{routing::get, Router};

use crate::state::AppState;
use crate::ws;

/// Build the gateway router: the WebSocket endpoint plus a liveness probe.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::handler::ws_upgrade))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}
