//! Errors from the wire protocol layer.

use std::time::Duration;

use fleetwire_types::FleetError;
use thiserror::Error;

/// Why a handshake was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("invalid client type '{0}'")]
    UnknownClientType(String),
    #[error("malformed handshake: {0}")]
    Malformed(String),
    #[error("non-text frame during handshake")]
    NonTextFrame,
    #[error("handshake timed out")]
    Timeout,
    #[error("connection closed during handshake")]
    Closed,
    #[error("peer id '{0}' already has a live session")]
    DuplicatePeer(String),
    #[error("rejected by listener: {0}")]
    Rejected(String),
}

impl HandshakeError {
    /// The reason string sent to the connector in `auth_failure`.
    pub fn reason(&self) -> String {
        match self {
            Self::InvalidCredentials => "Invalid credentials".to_string(),
            Self::UnknownClientType(_) => "Invalid client type".to_string(),
            Self::DuplicatePeer(_) => "Peer already connected".to_string(),
            other => other.to_string(),
        }
    }
}

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    /// A construction-time configuration fault.
    #[error(transparent)]
    Config(#[from] FleetError),
    /// Connect, send or receive failed at the transport level.
    #[error("Transport error: {0}")]
    Transport(String),
    /// The remote end closed the connection.
    #[error("Connection closed: {0}")]
    Closed(String),
    /// The handshake did not complete.
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    /// A frame was well-formed JSON but violated the protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A bounded wait expired.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    /// The component was stopped.
    #[error("Stopped")]
    Stopped,
}

/// Alias for wire results.
pub type WireResult<T> = Result<T, WireError>;
