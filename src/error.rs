//! The gateway's sealed error taxonomy.
//!
//! Every fallible operation in the request path returns [`GatewayError`]
//! rather than a loose `anyhow::Error` — callers (dispatch, the streaming
//! primitive, axum handlers) match on the variant instead of string-sniffing.
//! [`IntoResponse`] maps each variant to the HTTP status the design calls for.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Sealed error type for the request path.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The requested model string did not resolve to any configured group.
    #[error("model not found: {0}")]
    NotFound(String),

    /// The client pool could not produce a usable client (e.g. invalid header
    /// bytes in a configured API key, TLS setup failure).
    #[error("client init failed: {0}")]
    ClientInitError(String),

    /// Upstream responded before streaming began with a non-2xx status.
    #[error("upstream returned {status}: {text}")]
    UpstreamError { status: u16, text: String },

    /// A network error occurred before any response bytes were produced.
    /// Contributes to failover; the last one observed is surfaced if every
    /// candidate exhausts itself this way.
    #[error("transport error: {0}")]
    TransportError(String),

    /// A network error occurred after streaming had already begun. Dispatch
    /// never sees this directly — the streaming primitive converts it into a
    /// framed error chunk and ends the stream cleanly.
    #[error("mid-stream error: {0}")]
    MidStreamError(String),

    /// The inbound request body could not be parsed, even after a lenient
    /// UTF-8 re-decode with replacement characters.
    #[error("could not decode request: {0}")]
    DecodeError(String),

    /// A registry or configuration inconsistency that should be unreachable
    /// in a correctly wired gateway. Logged in full, never leaked to clients.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::ClientInitError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::UpstreamError { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::TransportError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::MidStreamError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::DecodeError(_) => StatusCode::BAD_REQUEST,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The class-name-shaped tag used when framing a mid-stream error chunk
    /// or reporting a post-failover `TransportError`, e.g. `"TransportError"`.
    pub fn class_name(&self) -> &'static str {
        match self {
            GatewayError::NotFound(_) => "NotFound",
            GatewayError::ClientInitError(_) => "ClientInitError",
            GatewayError::UpstreamError { .. } => "UpstreamError",
            GatewayError::TransportError(_) => "TransportError",
            GatewayError::MidStreamError(_) => "MidStreamError",
            GatewayError::DecodeError(_) => "DecodeError",
            GatewayError::Internal(_) => "Internal",
        }
    }
}

const MAX_UPSTREAM_TEXT: usize = 4096;

impl GatewayError {
    /// Build an [`UpstreamError`][Self::UpstreamError], truncating the body text.
    pub fn upstream(status: u16, text: impl Into<String>) -> Self {
        let mut text = text.into();
        if text.len() > MAX_UPSTREAM_TEXT {
            text.truncate(MAX_UPSTREAM_TEXT);
        }
        GatewayError::UpstreamError { status, text }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::TransportError(e.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self, kind = self.class_name(), "request failed");
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
