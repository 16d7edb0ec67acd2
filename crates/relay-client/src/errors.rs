//! Client error types.

use relay_core::{CoreError, ProtocolKey};
use thiserror::Error;

/// Errors surfaced by [`RelayClient`](crate::RelayClient).
#[derive(Debug, Error)]
pub enum ClientError {
    /// Socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Codec or body failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// WebSocket handshake or transport failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    /// No live link.
    #[error("not connected")]
    NotConnected,

    /// The link closed while a reply was pending.
    #[error("connection closed")]
    Closed,

    /// No correlated reply within the request timeout.
    #[error("request {request_id} on {key} timed out")]
    Timeout {
        /// Protocol of the request.
        key: ProtocolKey,
        /// Correlation id.
        request_id: u64,
    },

    /// The server never announced a session id.
    #[error("no session notice from server")]
    NoSession,

    /// AUTH was refused.
    #[error("authentication failed ({code}): {message}")]
    AuthFailed {
        /// AUTH_RESULT code.
        code: i32,
        /// AUTH_RESULT reason.
        message: String,
    },
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
