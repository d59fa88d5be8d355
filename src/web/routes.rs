use axum::{
    middleware,
    routing::{any, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::middleware::auth_middleware;
use super::ws::{camera_ws_handler, signaling_ws_handler};
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // WebSocket endpoints authenticate via the token query parameter inside
    // their handlers; health is open
    let public_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ws/camera", any(camera_ws_handler))
        .route("/ws/webrtc", any(signaling_ws_handler));

    // Bearer-authenticated HTTP surface
    let protected_routes = Router::new()
        .route("/webrtc/ice-servers", get(handlers::ice_servers))
        .route("/webrtc/rooms", get(handlers::webrtc_rooms))
        .route(
            "/webrtc/rooms/:room_id/clients",
            get(handlers::webrtc_room_clients),
        )
        .route("/devices/register", post(handlers::register_device))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let api_routes = Router::new().merge(public_routes).merge(protected_routes);

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
