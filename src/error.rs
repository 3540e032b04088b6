//! Error types for Friends Federation
//!
//! All errors in the crate are converted to `AppError`,
//! which implements `IntoResponse` for the thin HTTP adapter.
//! Transport failures carry their own `TransportError` so callers
//! can tell a timeout from a rejected delivery.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Failure of a call made through the federation transport
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Connection, DNS or TLS failure
    #[error("network error: {0}")]
    Network(String),

    /// The call did not finish before the configured deadline
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The remote server answered with a non-2xx status
    #[error("HTTP {status} {message}")]
    Status { status: u16, message: String },

    /// The remote server answered, but the body was unusable
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Federation transport failure (502)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Inbound activity from an actor we do not follow
    #[error("Not following {0}")]
    NotFollowed(String),

    /// Malformed inbound payload (400)
    #[error("Invalid activity: {0}")]
    InvalidActivity(String),

    /// Actor metadata without a usable id or url
    #[error("Ambiguous actor: {0}")]
    AmbiguousActor(String),

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Short label used for metrics and inbound rejection reasons
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound => "not_found",
            AppError::Transport(_) => "transport",
            AppError::NotFollowed(_) => "not_followed",
            AppError::InvalidActivity(_) => "invalid_activity",
            AppError::AmbiguousActor(_) => "ambiguous_actor",
            AppError::Validation(_) => "validation",
            AppError::HttpClient(_) => "http_client",
            AppError::Config(_) => "config",
            AppError::Internal(_) => "internal",
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidActivity(err.to_string())
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Maps each error variant to appropriate HTTP status code
    /// and JSON error body.
    fn into_response(self) -> Response {
        use axum::Json;

        let status = match &self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::NotFollowed(_) => StatusCode::FORBIDDEN,
            AppError::InvalidActivity(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::AmbiguousActor(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Transport(_) | AppError::HttpClient(_) => StatusCode::BAD_GATEWAY,
            AppError::Config(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let error_message = match &self {
            AppError::Config(_) | AppError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[self.kind()]).inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
