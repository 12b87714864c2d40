//! Error types for the bridge protocol client.

use std::time::Duration;

/// Errors surfaced by bridge operations.
///
/// Transport failures are never retried by the client itself; callers decide.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// The socket could not be opened.
    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    /// The peer rejected the shared secret or never answered the handshake.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// No connection is established.
    #[error("Not connected to bridge")]
    NotConnected,

    /// The connection dropped while the request was outstanding.
    #[error("Connection lost")]
    ConnectionLost,

    /// The operation did not complete within its window.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// The peer executed the tool and reported a failure.
    #[error("Tool {tool} failed: {message}")]
    ToolFailed { tool: String, message: String },

    /// The peer answered with an error message.
    #[error("Bridge error: {0}")]
    Remote(String),

    /// A message could not be encoded or was malformed.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Automatic reconnection gave up.
    #[error("Reconnection failed after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },
}

impl BridgeError {
    /// True for transport-level failures, as opposed to tool failures.
    pub fn is_transport(&self) -> bool {
        !matches!(self, BridgeError::ToolFailed { .. } | BridgeError::Remote(_))
    }

    /// True if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::Timeout { .. })
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Protocol(err.to_string())
    }
}

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
