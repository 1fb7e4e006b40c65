//! Error types for the model router.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Error taxonomy for routing, admission and backend operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Auth gate rejection. Carries no detail so a denied caller cannot
    /// probe which model ids exist.
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Model not loaded: {0}")]
    ModelNotLoaded(String),

    #[error("Load failed: {0}")]
    LoadFailed(String),

    #[error("Capacity exhausted: {0}")]
    CapacityExhausted(String),

    #[error("Model busy: {0}")]
    Busy(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable error type, used in bodies and logs.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::Unauthorized => "unauthorized",
            Error::ModelNotFound(_) => "model_not_found",
            Error::ModelNotLoaded(_) => "model_not_loaded",
            Error::LoadFailed(_) => "load_failed",
            Error::CapacityExhausted(_) => "capacity_exhausted",
            Error::Busy(_) => "busy",
            Error::Backend(_) => "backend_error",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::ModelNotFound(_) => StatusCode::NOT_FOUND,
            Error::ModelNotLoaded(_) => StatusCode::BAD_REQUEST,
            Error::LoadFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::CapacityExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Busy(_) => StatusCode::CONFLICT,
            Error::Backend(_) => StatusCode::BAD_GATEWAY,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
