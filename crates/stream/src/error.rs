//! Wire-level error taxonomy.
//!
//! Every internal failure maps to a machine-readable code and an HTTP
//! status; handlers never leak internal error channels verbatim.

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// Error codes carried in response bodies.
pub mod code {
    pub const BAD_REQUEST: &str = "BAD_REQUEST";
    pub const INVALID_OFFSET: &str = "INVALID_OFFSET";
    pub const PARSE_ERROR: &str = "PARSE_ERROR";
    pub const MISSING_UPSTREAM_URL: &str = "MISSING_UPSTREAM_URL";
    pub const MISSING_UPSTREAM_METHOD: &str = "MISSING_UPSTREAM_METHOD";
    pub const INVALID_UPSTREAM_METHOD: &str = "INVALID_UPSTREAM_METHOD";
    pub const INVALID_ACTION: &str = "INVALID_ACTION";
    pub const REDIRECT_NOT_ALLOWED: &str = "REDIRECT_NOT_ALLOWED";
    pub const MISSING_SECRET: &str = "MISSING_SECRET";
    pub const MISSING_SIGNATURE: &str = "MISSING_SIGNATURE";
    pub const SIGNATURE_EXPIRED: &str = "SIGNATURE_EXPIRED";
    pub const CONFLICT_EXISTS: &str = "CONFLICT_EXISTS";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const ALLOWLIST_DENIED: &str = "ALLOWLIST_DENIED";
    pub const STALE_EPOCH: &str = "STALE_EPOCH";
    pub const STREAM_NOT_FOUND: &str = "STREAM_NOT_FOUND";
    pub const CONFLICT_SEQ: &str = "CONFLICT_SEQ";
    pub const SEQUENCE_GAP: &str = "SEQUENCE_GAP";
    pub const STREAM_CLOSED: &str = "STREAM_CLOSED";
    pub const MESSAGE_TOO_LARGE: &str = "MESSAGE_TOO_LARGE";
    pub const UPSTREAM_ERROR: &str = "UPSTREAM_ERROR";
    pub const INTERNAL: &str = "INTERNAL";
}

/// A classified wire error: status, code, human message, and any
/// diagnostic headers (`Producer-Epoch`, `Producer-Expected-Seq`, ...).
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub headers: Vec<(HeaderName, String)>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: &'a str,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: impl ToString) -> Self {
        self.headers.push((name, value.to_string()));
        self
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(path: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            code::STREAM_NOT_FOUND,
            format!("stream not found: {}", path),
        )
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    pub fn forbidden(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, code, message)
    }

    pub fn unauthorized(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, code, message)
    }

    pub fn too_large(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            code::MESSAGE_TOO_LARGE,
            message,
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code::INTERNAL, message)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.status.as_u16(), self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::to_string(&ErrorBody {
            error: self.code,
            message: &self.message,
        })
        .unwrap_or_else(|_| format!("{{\"error\":\"{}\"}}", self.code));

        let mut builder = Response::builder()
            .status(self.status)
            .header(axum::http::header::CONTENT_TYPE, "application/json");
        for (name, value) in &self.headers {
            if let Ok(v) = HeaderValue::from_str(value) {
                builder = builder.header(name.clone(), v);
            }
        }
        builder
            .body(Body::from(body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}
