//! Error taxonomy shared by the hub and the controller
//!
//! Service code returns one of the kinds below; the HTTP layer maps kinds
//! to status codes here, the WebSocket layer picks close codes itself, and
//! the controller's loops absorb errors locally instead of propagating.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    /// Token missing, expired, malformed, or signed with the wrong key
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Malformed or out-of-range input; the peer can fix and retry
    #[error("invalid input: {0}")]
    Validation(String),

    /// Peer gone, socket closed, send failed; recovered locally
    #[error("transport: {0}")]
    Transport(String),

    /// Camera unavailable or refused a frame
    #[error("camera: {0}")]
    Camera(String),

    /// GPIO line could not be read or driven
    #[error("gpio: {0}")]
    Gpio(String),

    #[error("configuration: {0}")]
    Config(String),

    #[error("database: {0}")]
    Db(#[from] sqlx::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("internal: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status this kind surfaces as
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Transport(_)
            | AppError::Camera(_)
            | AppError::Gpio(_)
            | AppError::Config(_)
            | AppError::Db(_)
            | AppError::Io(_)
            | AppError::Encoding(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// `{"detail": ...}` body, the shape the REST surface already speaks
#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = self.to_string();

        if status.is_server_error() {
            tracing::error!(%status, %detail, "request failed");
        } else {
            tracing::warn!(%status, %detail, "request rejected");
        }

        (status, Json(ErrorBody { detail })).into_response()
    }
}
