//! HTTP/WebSocket surface of the hub

pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod ws;

pub use routes::create_router;
