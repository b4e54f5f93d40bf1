//! Errors that carry a transport status code.
//!
//! Deep layers (CA clients, token exchange, certificate validation) know the
//! exact failure surface long before a handler does. [`StatusError`] lets them
//! tag an error with the status it should produce at the HTTP boundary, so
//! composition preserves the tag and only the handler maps it to a response.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// An error message paired with the transport status it maps to.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct StatusError {
    /// Human-readable failure description, rendered as the response body.
    pub message: String,
    /// The transport status this error surfaces as.
    pub status: StatusCode,
}

impl StatusError {
    /// Creates a new error with the given status and message.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status,
        }
    }

    /// Wraps an existing error, keeping its message and attaching a status.
    pub fn wrap(status: StatusCode, err: &dyn std::error::Error) -> Self {
        Self {
            message: err.to_string(),
            status,
        }
    }

    /// Combines a context message with a cause, preserving both.
    pub fn with_context(
        status: StatusCode,
        context: impl Into<String>,
        err: &dyn std::error::Error,
    ) -> Self {
        Self {
            message: format!("{}: {}", context.into(), err),
            status,
        }
    }
}

impl IntoResponse for StatusError {
    fn into_response(self) -> Response {
        (self.status, format!("{}\n", self.message)).into_response()
    }
}
