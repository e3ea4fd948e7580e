//! # Error Handling
//!
//! Two error surfaces live here:
//!
//! - [`AppError`]: failures of the HTTP endpoints, turned into JSON responses
//! - [`SessionError`]: failures of a live session, turned into an `error`
//!   frame on the socket followed by a close
//!
//! Upstream link failures have their own type, [`crate::live::LiveError`], and
//! collaborator calls use `anyhow`; both convert into the two types above.
//!
//! ## JSON Response Format:
//! All HTTP errors return JSON with a consistent structure:
//! ```json
//! {
//!   "error": {
//!     "type": "validation_error",
//!     "message": "Server port cannot be 0",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use crate::live::LiveError;
use crate::session::protocol::ErrorCode;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Errors returned by HTTP handlers.
///
/// ## Error Categories:
/// - **Internal / ConfigError**: server-side problems (500)
/// - **BadRequest / ValidationError**: the client sent something unusable (400)
/// - **NotFound**: the resource doesn't exist (404)
/// - **ServiceUnavailable**: capacity or a collaborator is missing (503)
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.as_str()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.as_str()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.as_str()),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.as_str()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.as_str()),
            AppError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg.as_str()),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();
        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, hence 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Why a live session could not start or had to stop.
///
/// Every variant maps to exactly one wire [`ErrorCode`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    #[error("{0}")]
    AuthRequired(String),

    #[error("Character not found: {0}")]
    CharacterNotFound(String),

    #[error("Auth timeout")]
    AuthTimeout,

    #[error("{0}")]
    UpstreamDisconnected(String),

    #[error("{0}")]
    Internal(String),
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::AuthRequired(_) => ErrorCode::AuthRequired,
            SessionError::CharacterNotFound(_) => ErrorCode::CharacterNotFound,
            SessionError::AuthTimeout => ErrorCode::Timeout,
            SessionError::UpstreamDisconnected(_) => ErrorCode::UpstreamDisconnected,
            SessionError::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl From<LiveError> for SessionError {
    fn from(err: LiveError) -> Self {
        SessionError::UpstreamDisconnected(err.to_string())
    }
}

impl From<anyhow::Error> for SessionError {
    fn from(err: anyhow::Error) -> Self {
        SessionError::Internal(err.to_string())
    }
}
