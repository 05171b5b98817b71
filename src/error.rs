//! Proxy error types.
//!
//! The taxonomy mirrors what a client can observe:
//!
//! - **Client payload errors** (`MalformedPayload`, `UnknownProvider`) are answered
//!   with a 4xx before any upstream call is made.
//! - **Upstream failures** (`UpstreamUnavailable`) are answered with a 5xx and never
//!   retried, since a chat completion is not known to be idempotent.
//! - **Compression engine failures** (`CompressionEngine`) are absorbed by the
//!   compression gate, which falls back to the uncompressed conversation. They
//!   only appear as values inside the crate.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Proxy errors.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Request body could not be parsed or lacks the message list.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// No configured provider matched the request.
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// Forwarding to the upstream provider failed.
    #[error("Upstream unavailable: {reason}")]
    UpstreamUnavailable {
        /// Transport-level failure description.
        reason: String,
        /// Whether the upstream call hit its deadline.
        timed_out: bool,
    },

    /// The external compression engine failed or timed out.
    #[error("Compression engine error: {0}")]
    CompressionEngine(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// Server-side error.
    #[error("Server error: {0}")]
    Server(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// HTTP status surfaced to the client for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::MalformedPayload(_) | ProxyError::UnknownProvider(_) => {
                StatusCode::BAD_REQUEST
            },
            ProxyError::UpstreamUnavailable { timed_out: true, .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable error type for the JSON envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::MalformedPayload(_) => "malformed_payload",
            ProxyError::UnknownProvider(_) => "unknown_provider",
            ProxyError::UpstreamUnavailable { .. } => "upstream_unavailable",
            ProxyError::CompressionEngine(_) => "compression_engine",
            ProxyError::Config(_) => "config_error",
            ProxyError::Server(_) | ProxyError::Io(_) => "proxy_error",
            ProxyError::Json(_) => "json_error",
        }
    }

    /// Whether the error is the client's fault (no upstream call was attempted).
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(json!({
                "error": {
                    "message": self.to_string(),
                    "type": self.kind(),
                }
            })),
        )
            .into_response()
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::UpstreamUnavailable {
            timed_out: err.is_timeout(),
            reason: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for ProxyError {
    fn from(err: toml::de::Error) -> Self {
        ProxyError::Config(err.to_string())
    }
}
