//! Error types for the hub client.

use thiserror::Error;

/// Errors raised while establishing the authenticated session.
///
/// `OutOfOrder` is a programming error (a handshake step called before its
/// prerequisite). Every other variant is recoverable at the link layer and
/// drives the one-shot self-registration fallback.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Handshake step out of order: {0}")]
    OutOfOrder(&'static str),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Challenge could not be decrypted (user unknown to gateway)")]
    UnknownUser,

    #[error("Hub rejected authentication: {0}")]
    Rejected(String),

    #[error("Unexpected handshake message: {0}")]
    Protocol(String),
}

/// Errors that can occur while talking to the hub.
#[derive(Debug, Error)]
pub enum HubError {
    /// Socket-level failure; surfaces as connection lost.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Explicit error envelope returned by the hub.
    #[error("Command {method} failed: {code}: {message}")]
    Command {
        method: String,
        code: String,
        message: String,
    },

    #[error("Command {method} timed out")]
    Timeout { method: String },

    #[error("Not connected to hub")]
    NotConnected,

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// The link was closed while the command was awaiting its response.
    #[error("Connection closed while awaiting {method}")]
    Disconnected { method: String },

    #[error("Malformed payload: {0}")]
    Parse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HubError {
    /// Whether the error came from the handshake (as opposed to the socket or a command).
    pub fn is_handshake(&self) -> bool {
        matches!(self, Self::Handshake(_))
    }

    /// Whether the error is a command timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for HubError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Result type for hub operations.
pub type HubResult<T> = Result<T, HubError>;
