//! Client-facing gateway: terminates websocket connections and speaks the
//! `browser:*` message protocol against the session registry.

mod ws;

use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use browsermux_core::{metrics, SessionRegistry};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<SessionRegistry>,
}

pub fn router(registry: Arc<SessionRegistry>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_headers(Any);

    Router::new()
        .route("/client", get(ws::websocket_handler))
        .route("/healthz", get(health_handler))
        .layer(cors)
        .with_state(GatewayState { registry })
}

async fn health_handler() -> Json<serde_json::Value> {
    let snapshot = metrics::snapshot();
    Json(json!({
        "status": "ok",
        "metrics": {
            "commands": snapshot.commands,
            "commandFailures": snapshot.command_failures,
            "events": snapshot.events,
            "frames": snapshot.frames,
            "sessionsCreated": snapshot.sessions_created,
            "sessionsDestroyed": snapshot.sessions_destroyed,
        },
    }))
}
