//! WebSocket error types.
//!
//! Provides error types for channel client operations.

use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::error::{ProtocolError, SubProtocolError};

/// Channel client errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WsError {
    /// The opening handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A connect is already in flight.
    #[error("connection already in progress")]
    ConnectInProgress,

    /// The pending connect was settled by `disconnect()`.
    #[error("connect cancelled")]
    Cancelled,

    /// The session token cannot be carried as a subprotocol header.
    #[error("invalid session token: {0}")]
    InvalidToken(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to serialize an outbound envelope.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to decode an inbound frame into the requested type.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// The server accepted the upgrade without echoing the token
    /// subprotocol. The session token is only ever carried that way, so
    /// the server must select it.
    #[error("server did not echo the session subprotocol")]
    SubprotocolNotEchoed,
}

impl From<tungstenite::Error> for WsError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Protocol(ProtocolError::SecWebSocketSubProtocolError(
                SubProtocolError::NoSubProtocol,
            )) => Self::SubprotocolNotEchoed,
            err => Self::Handshake(err.to_string()),
        }
    }
}
