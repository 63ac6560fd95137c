//! Combines the route groups of every module into one router.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;

use crate::core::shared::state::AppState;
use crate::notifications::handlers::configure_notification_routes;
use crate::security::access_handlers::configure_access_routes;
use crate::sessions::handlers::configure_session_routes;

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "storage": if state.conn.is_some() { "postgres" } else { "memory" },
    }))
}

pub fn configure_api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .merge(configure_session_routes())
        .merge(configure_access_routes())
        .merge(configure_notification_routes())
}
