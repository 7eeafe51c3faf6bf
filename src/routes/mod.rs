//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! Binds the websocket endpoint and the REST map surface under a single Axum
//! router. Everything stateful happens through `AppState`; routes are pure
//! protocol translation.

pub mod maps;
pub mod ws;

use axum::Router;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router: websocket + REST + health check.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/ws", get(ws::handle_ws))
        .route("/api/map", get(maps::list_maps_rest).post(maps::create_map_rest))
        .route(
            "/api/map/{id}",
            get(maps::get_map_rest).delete(maps::delete_map_rest),
        )
        .route("/api/map/{id}/objects", get(maps::list_objects_rest))
        .route("/api/map/{id}/timeline", get(maps::get_timeline_rest))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}
