//! Error types and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias using the gateway's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the gateway.
///
/// Large error variants are boxed to reduce stack size.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(Box<axum::http::Error>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Authorization error
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bad request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Resource conflict (409) — e.g. a workflow name that already exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Validation error (422)
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// External service error (502)
    #[error("External service error: {0}")]
    External(String),

    /// Internal server error
    #[error("Internal server error: {0}")]
    Internal(String),

    /// Caller lacks a valid credential (distinct from `Forbidden`, which is
    /// an authenticated caller lacking permission)
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Rate limit admission was denied for a (key, server) bucket
    #[error("Rate limit exceeded: {remaining_per_minute} left this minute, {remaining_per_day} left today")]
    RateLimited {
        /// Requests remaining in the current minute window
        remaining_per_minute: u32,
        /// Requests remaining in the current day window
        remaining_per_day: u32,
        /// When the next window reset occurs
        reset_at: chrono::DateTime<chrono::Utc>,
    },

    /// The circuit for a backend server is open and rejecting calls
    #[error("Circuit open for server {server_id}, retry after {retry_after_ms}ms")]
    CircuitOpen {
        /// The server whose circuit is open
        server_id: uuid::Uuid,
        /// Milliseconds the caller should wait before retrying
        retry_after_ms: u64,
    },

    /// A backend server returned an error; the message is surfaced verbatim
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// An operation exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The secret scanner matched one or more patterns in a workflow definition
    #[error("Secret detected at {0:?}")]
    SecretDetected(Vec<String>),

    /// A budget rule's usage would be exceeded by the requested execution
    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,

    /// Optional error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// HTTP status code
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
            status: status.as_u16(),
        }
    }

    /// Create a new error response with an error code
    pub fn with_code(status: StatusCode, code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: Some(code.into()),
            status: status.as_u16(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Retry-After carries reset/backoff hints for rate-limit and circuit errors.
        let retry_after_secs: Option<u64> = match &self {
            Error::RateLimited { reset_at, .. } => Some((*reset_at - chrono::Utc::now()).num_seconds().max(0) as u64),
            Error::CircuitOpen { retry_after_ms, .. } => Some(retry_after_ms.div_ceil(1000)),
            _ => None,
        };

        let (status, error_response) = match self {
            Error::Config(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::with_code(StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR", e.to_string()),
            ),

            Error::Http(e) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::with_code(StatusCode::BAD_REQUEST, "HTTP_ERROR", e.to_string()),
            ),

            Error::Io(e) => {
                tracing::error!("I/O error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR", "I/O operation failed"),
                )
            }

            Error::Forbidden(msg) => (StatusCode::FORBIDDEN, ErrorResponse::with_code(StatusCode::FORBIDDEN, "FORBIDDEN", msg)),

            Error::NotFound(msg) => (StatusCode::NOT_FOUND, ErrorResponse::with_code(StatusCode::NOT_FOUND, "NOT_FOUND", msg)),

            Error::BadRequest(msg) => (StatusCode::BAD_REQUEST, ErrorResponse::with_code(StatusCode::BAD_REQUEST, "BAD_REQUEST", msg)),

            Error::Conflict(msg) => (StatusCode::CONFLICT, ErrorResponse::with_code(StatusCode::CONFLICT, "CONFLICT", msg)),

            Error::ValidationError(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorResponse::with_code(StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR", msg),
            ),

            Error::External(msg) => {
                tracing::error!("External service error: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    ErrorResponse::with_code(StatusCode::BAD_GATEWAY, "EXTERNAL_ERROR", "External service unavailable"),
                )
            }

            Error::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", "Internal server error"),
                )
            }

            Error::Unauthenticated(msg) => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse::with_code(StatusCode::UNAUTHORIZED, "UNAUTHENTICATED", msg),
            ),

            Error::RateLimited { remaining_per_minute, remaining_per_day, reset_at } => {
                let mut resp = ErrorResponse::with_code(
                    StatusCode::TOO_MANY_REQUESTS,
                    "RATE_LIMITED",
                    format!(
                        "rate limit exceeded, remaining_per_minute={}, remaining_per_day={}, resets_at={}",
                        remaining_per_minute, remaining_per_day, reset_at
                    ),
                );
                resp.status = StatusCode::TOO_MANY_REQUESTS.as_u16();
                (StatusCode::TOO_MANY_REQUESTS, resp)
            }

            Error::CircuitOpen { server_id, retry_after_ms } => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorResponse::with_code(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "CIRCUIT_OPEN",
                    format!("server {} circuit open, retry after {}ms", server_id, retry_after_ms),
                ),
            ),

            Error::Upstream(msg) => {
                tracing::warn!("Upstream error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(StatusCode::INTERNAL_SERVER_ERROR, "UPSTREAM_ERROR", msg),
                )
            }

            Error::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, ErrorResponse::with_code(StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", msg)),

            Error::SecretDetected(paths) => (
                StatusCode::CONFLICT,
                ErrorResponse::with_code(StatusCode::CONFLICT, "SECRET_DETECTED", format!("possible secret material at: {}", paths.join(", "))),
            ),

            Error::BudgetExceeded(msg) => (StatusCode::FORBIDDEN, ErrorResponse::with_code(StatusCode::FORBIDDEN, "BUDGET_EXCEEDED", msg)),
        };

        let mut response = (status, Json(error_response)).into_response();
        if let Some(secs) = retry_after_secs {
            if let Ok(value) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<axum::http::Error> for Error {
    fn from(err: axum::http::Error) -> Self {
        Error::Http(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response() {
        let err = ErrorResponse::new(StatusCode::NOT_FOUND, "User not found");
        assert_eq!(err.status, 404);
        assert_eq!(err.error, "User not found");
        assert!(err.code.is_none());
    }

    #[test]
    fn test_error_response_with_code() {
        let err = ErrorResponse::with_code(StatusCode::BAD_REQUEST, "INVALID_EMAIL", "Email format is invalid");
        assert_eq!(err.status, 400);
        assert_eq!(err.error, "Email format is invalid");
        assert_eq!(err.code, Some("INVALID_EMAIL".to_string()));
    }

    #[test]
    fn rate_limited_sets_retry_after_header() {
        let reset_at = chrono::Utc::now() + chrono::Duration::seconds(30);
        let err = Error::RateLimited { remaining_per_minute: 0, remaining_per_day: 5, reset_at };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(axum::http::header::RETRY_AFTER));
    }

    #[test]
    fn circuit_open_sets_retry_after_header() {
        let err = Error::CircuitOpen { server_id: uuid::Uuid::now_v7(), retry_after_ms: 2500 };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().contains_key(axum::http::header::RETRY_AFTER));
    }

    #[test]
    fn conflict_maps_to_409() {
        let err = Error::Conflict("workflow 'x' already exists".into());
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }
}
