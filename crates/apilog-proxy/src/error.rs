//! Per-exchange failures and the status each one surfaces as

use hyper::StatusCode;
use thiserror::Error;

/// Errors that end an exchange early. All of them still produce a
/// well-formed HTTP response for the caller and a logged record.
#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    #[error("Request body exceeds the limit of {limit} bytes")]
    RequestTooLarge { limit: usize },

    #[error("Failed to read request body: {0}")]
    RequestBody(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Connection to upstream {target} failed: {reason}")]
    ConnectionFailed { target: String, reason: String },

    #[error("Connecting to upstream {target} timed out after {secs}s")]
    ConnectTimeout { target: String, secs: u64 },

    #[error("Upstream did not respond within {secs}s")]
    ResponseTimeout { secs: u64 },

    #[error("Upstream request failed: {0}")]
    RequestFailed(String),

    #[error("Upstream body error: {0}")]
    ResponseBody(String),

    #[error("Client disconnected before the upstream responded")]
    ClientDisconnected,
}

impl ProxyError {
    /// Status synthesized for the caller
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RequestTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RequestBody(_) | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::ConnectTimeout { .. } | Self::ResponseTimeout { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }
            Self::ConnectionFailed { .. }
            | Self::RequestFailed(_)
            | Self::ResponseBody(_)
            | Self::ClientDisconnected => StatusCode::BAD_GATEWAY,
        }
    }

    /// Rejected before any upstream contact
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::RequestTooLarge { .. } | Self::RequestBody(_) | Self::InvalidRequest(_)
        )
    }
}
