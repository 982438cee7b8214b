// =============================================================================
// HTTP/WS shell
// =============================================================================

pub mod rest;
pub mod ws;

use std::sync::Arc;

use axum::Router;

use crate::app_state::AppState;

/// Merges the REST and WebSocket routers into the single router `main` serves.
pub fn router(state: Arc<AppState>) -> Router {
    rest::router(state.clone()).merge(ws::router(state))
}
