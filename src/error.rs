//! Error types for the Ratewarden service.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Main error type for Ratewarden operations.
#[derive(Error, Debug)]
pub enum RatewardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A check named a limiter the registry does not hold
    #[error("Unknown limiter: {0}")]
    UnknownLimiter(String),

    /// HTTP client construction errors
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for RatewardenError {
    fn from(err: ::config::ConfigError) -> Self {
        RatewardenError::Config(err.to_string())
    }
}

impl IntoResponse for RatewardenError {
    fn into_response(self) -> Response {
        let status = match &self {
            RatewardenError::UnknownLimiter(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, RatewardenError>;

/// Errors raised by a window store backend.
///
/// These never reach callers of the limiter; the failure policy turns them
/// into a decision.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend did not answer within the configured timeout
    #[error("window store timed out after {0} ms")]
    Timeout(u64),

    /// The request could not be delivered
    #[error("window store transport error: {0}")]
    Transport(String),

    /// The backend answered with an error
    #[error("window store returned {status}: {message}")]
    Upstream { status: u16, message: String },

    /// The backend answered with something we could not interpret
    #[error("malformed window store response: {0}")]
    Malformed(String),
}
