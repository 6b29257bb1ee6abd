//! Error taxonomy for the collaboration transport.

use thiserror::Error;

use crate::chunker::ChunkError;
use crate::transport::TransportError;

/// Result type for connection operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the connection manager.
///
/// Every variant is cheap to clone so the same error can be returned to a
/// caller and broadcast to observers.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// Opening the transport failed or the link dropped (retryable).
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The server rejected our credentials (not retryable until they change).
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// An ack, response or connect deadline passed (retryable).
    #[error("Timed out: {0}")]
    Timeout(String),

    /// An inbound payload could not be decoded; the message is dropped.
    #[error("Malformed message: {0}")]
    ParseError(String),

    /// The transport refused an outbound frame.
    #[error("Failed to send message: {0}")]
    MessageSendFailed(String),

    /// The operation needs a live connection.
    #[error("Not connected (state: {0})")]
    NotConnected(String),

    /// The connection closed while the operation was outstanding.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The URL could not be parsed or has an unsupported scheme.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// A decoded message broke a structural rule.
    #[error("Invalid message: {0}")]
    Validation(String),

    /// Chunking or reassembly failed.
    #[error(transparent)]
    Chunk(#[from] ChunkError),
}

impl SyncError {
    /// Whether retrying the same action can reasonably succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::Timeout(_)
                | Self::MessageSendFailed(_)
                | Self::ConnectionClosed
        )
    }

    /// Whether a user must act (new credentials, manual reconnect).
    #[must_use]
    pub fn requires_user_action(&self) -> bool {
        matches!(self, Self::AuthenticationFailed(_) | Self::InvalidUrl(_))
    }

    /// Short label used for metrics and log fields.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::ConnectionFailed(_) => "connection_failed",
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::Timeout(_) => "timeout",
            Self::ParseError(_) => "parse_error",
            Self::MessageSendFailed(_) => "message_send_failed",
            Self::NotConnected(_) => "not_connected",
            Self::ConnectionClosed => "connection_closed",
            Self::InvalidUrl(_) => "invalid_url",
            Self::Validation(_) => "validation",
            Self::Chunk(_) => "chunk",
        }
    }
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unauthorized(msg) => Self::AuthenticationFailed(msg),
            TransportError::Network(msg) | TransportError::Other(msg) => Self::ConnectionFailed(msg),
            TransportError::InvalidRequest(msg) => Self::InvalidUrl(msg),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::ParseError(err.to_string())
    }
}
