//! Error types for inkfed
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
///
/// Remote failures are split by how a caller should react to them:
/// `TransientRemote` may succeed later, `PermanentRemote` and
/// `RemoteNotFound` will not.
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Blog unknown, silenced or not federating (404)
    #[error("Collection not found")]
    CollectionNotFound,

    /// Signature missing or failed verification (401)
    #[error("Invalid signature")]
    SignatureInvalid,

    /// Remote actor document is unusable (400)
    #[error("Malformed actor: {0}")]
    MalformedActor(String),

    /// Inbound activity could not be parsed (400)
    #[error("Malformed activity: {0}")]
    MalformedActivity(String),

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Request did not ask for a representation we serve (406)
    #[error("Not acceptable")]
    NotAcceptable,

    /// Remote host answered 404/410 (502)
    #[error("Remote resource not found: {0}")]
    RemoteNotFound(String),

    /// Remote host rejected the request with a 4xx (502)
    #[error("Remote rejected request: {0}")]
    PermanentRemote(String),

    /// Network failure, timeout or 5xx from a remote host (502)
    #[error("Remote temporarily unavailable: {0}")]
    TransientRemote(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Whether retrying the same remote call later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::TransientRemote(_))
    }

    /// Whether this is a unique-constraint violation reported by SQLite.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            AppError::Database(sqlx::Error::Database(db_error)) => db_error.is_unique_violation(),
            _ => false,
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Maps each error variant to appropriate HTTP status code
    /// and JSON error body.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message, error_type) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string(), "not_found"),
            AppError::CollectionNotFound => (
                StatusCode::NOT_FOUND,
                self.to_string(),
                "collection_not_found",
            ),
            AppError::SignatureInvalid => (
                StatusCode::UNAUTHORIZED,
                self.to_string(),
                "signature_invalid",
            ),
            AppError::MalformedActor(msg) => {
                (StatusCode::BAD_REQUEST, msg.clone(), "malformed_actor")
            }
            AppError::MalformedActivity(msg) => {
                (StatusCode::BAD_REQUEST, msg.clone(), "malformed_activity")
            }
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone(), "validation"),
            AppError::NotAcceptable => (
                StatusCode::NOT_ACCEPTABLE,
                self.to_string(),
                "not_acceptable",
            ),
            AppError::RemoteNotFound(_) => {
                (StatusCode::BAD_GATEWAY, self.to_string(), "remote_not_found")
            }
            AppError::PermanentRemote(_) => (
                StatusCode::BAD_GATEWAY,
                self.to_string(),
                "permanent_remote",
            ),
            AppError::TransientRemote(_) => (
                StatusCode::BAD_GATEWAY,
                self.to_string(),
                "transient_remote",
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
                "database",
            ),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone(), "config"),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "internal",
            ),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, error_type, "Request failed");
        } else {
            tracing::debug!(error = %self, error_type, "Request rejected");
        }

        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[error_type]).inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
