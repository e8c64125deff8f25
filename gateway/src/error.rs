use std::time::Duration;

/// Errors originating from the gateway layer.
///
/// String payloads carry the response body or close reason reported by the
/// remote service. Treat them as diagnostic text, not as something to match on.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("JSON processing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Remote API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Gateway protocol error: {0}")]
    Protocol(String),
    #[error("Authentication rejected: {0}")]
    Authentication(String),
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("An unknown error occurred: {0}")]
    Other(anyhow::Error),
}

impl GatewayError {
    /// The member, role or channel the call targeted no longer exists.
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound(_))
    }

    /// Failures worth retrying with backoff: rate limits, server-side errors
    /// and transport hiccups. Authentication and 4xx responses are not.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::RateLimited { .. }
            | GatewayError::WebSocket(_)
            | GatewayError::Timeout(_) => true,
            GatewayError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            GatewayError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
