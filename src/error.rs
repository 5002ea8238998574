//! Error taxonomy for the GrepWise core.
//!
//! Every externally observable failure is one of the kinds below; retries
//! and fallbacks for `TransientIO` are handled where the error originates
//! (Index Engine commits, Archive Engine I/O) and never leak a raw
//! `std::io::Error` across a component boundary.

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Unauthorized,
    TransientIO,
    ServiceUnavailable,
    Fatal,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidInput => "InvalidInput",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::TransientIO => "TransientIO",
            ErrorKind::ServiceUnavailable => "ServiceUnavailable",
            ErrorKind::Fatal => "Fatal",
            ErrorKind::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct GrepWiseError {
    pub kind: ErrorKind,
    pub message: String,
    pub correlation_id: Uuid,
    #[source]
    source: Option<anyhow::Error>,
}

impl GrepWiseError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), correlation_id: Uuid::new_v4(), source: None }
    }

    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn transient_io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientIO, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// Structured `{error, kind, correlationId}` body for REST responses.
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.message,
            "kind": self.kind,
            "correlationId": self.correlation_id,
        })
    }
}

impl From<std::io::Error> for GrepWiseError {
    fn from(err: std::io::Error) -> Self {
        GrepWiseError::transient_io(err.to_string()).with_source(err)
    }
}

pub type GrepWiseResult<T> = Result<T, GrepWiseError>;

/// REST endpoints return a structured `{error, kind, correlationId}` body
/// with the status code mapped below.
impl IntoResponse for GrepWiseError {
    fn into_response(self) -> Response {
        let status = match self.kind {
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::TransientIO | ErrorKind::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        };
        (status, Json(self.to_body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_carries_kind_and_correlation_id() {
        let err = GrepWiseError::invalid_input("bad query");
        let body = err.to_body();
        assert_eq!(body["kind"], "INVALID_INPUT");
        assert_eq!(body["error"], "bad query");
        assert!(body["correlationId"].is_string());
    }
}
