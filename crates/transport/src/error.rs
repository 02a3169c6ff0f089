//! Error types for transport links.

use std::time::Duration;

use relaydrop_protocol::ProtocolError;
use tokio_tungstenite::tungstenite;

/// Errors produced while connecting or exchanging frames.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection timed out")]
    Timeout,

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("link closed")]
    Closed,

    #[error("no traffic for {0:?}")]
    Inactive(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("malformed frame")]
    MalformedFrame,

    #[error("invalid rendezvous: {0}")]
    InvalidRendezvous(String),

    #[error("event queue already taken")]
    EventsTaken,
}

impl From<ProtocolError> for TransportError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Io(io) => Self::Io(io),
            _ => Self::MalformedFrame,
        }
    }
}
