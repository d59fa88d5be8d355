use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::state::AppState;

/// Extract the bearer token from the Authorization header
pub fn extract_bearer(headers: &axum::http::HeaderMap) -> Option<String> {
    let auth_header = headers.get(axum::http::header::AUTHORIZATION)?;
    let auth_str = auth_header.to_str().ok()?;
    auth_str.strip_prefix("Bearer ").map(str::to_string)
}

/// Authentication middleware for the HTTP surface
///
/// WebSocket endpoints authenticate inside their handlers (the token rides
/// the connect URL) and are mounted outside this layer.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = extract_bearer(request.headers()).ok_or(StatusCode::UNAUTHORIZED)?;

    match state.tokens.verify_access(&token) {
        Ok(subject) => {
            request.extensions_mut().insert(subject);
            Ok(next.run(request).await)
        }
        Err(_) => Err(StatusCode::UNAUTHORIZED),
    }
}
