use relaydrop_protocol::ErrorCode;
use relaydrop_transport::TransportError;

use crate::TransferStatus;

/// Errors produced by transfer sessions.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("malformed {0}")]
    Decode(&'static str),

    #[error("checksum mismatch on {}", chunk_label(.chunk))]
    ChecksumMismatch { chunk: Option<u32> },

    #[error("connection error: {0}")]
    Connection(#[from] TransportError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("resume attempts exhausted after {attempts} tries")]
    ResumeExhausted { attempts: u32 },

    #[error("peer reported: {0}")]
    Peer(String),

    #[error("transfer declined")]
    Declined,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: TransferStatus,
        to: TransferStatus,
    },

    #[error("transfer not found: {0}")]
    NotFound(String),

    #[error("transfer cannot be resumed: {0}")]
    NotResumable(String),

    #[error("resume already in progress: {0}")]
    ResumeInProgress(String),

    #[error("storage error: {0}")]
    Storage(String),
}

fn chunk_label(chunk: &Option<u32>) -> String {
    match chunk {
        Some(i) => format!("chunk {i}"),
        None => "whole file".into(),
    }
}

/// Cloneable classification of a [`TransferError`], carried in events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Decode,
    ChecksumMismatch,
    Connection,
    ProtocolViolation,
    Cancelled,
    ResumeExhausted,
    Peer,
    Declined,
    Io,
    Other,
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Decode(_) => ErrorKind::Decode,
            Self::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Self::Connection(_) => ErrorKind::Connection,
            Self::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::ResumeExhausted { .. } => ErrorKind::ResumeExhausted,
            Self::Peer(_) => ErrorKind::Peer,
            Self::Declined => ErrorKind::Declined,
            Self::Io(_) => ErrorKind::Io,
            _ => ErrorKind::Other,
        }
    }

    /// Code sent to the peer in an `Error` frame.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            Self::ChecksumMismatch { .. } => ErrorCode::Hash,
            Self::Decode(_) | Self::ProtocolViolation(_) => ErrorCode::Protocol,
            Self::Cancelled | Self::Declined => ErrorCode::Cancelled,
            Self::Io(_) | Self::Storage(_) => ErrorCode::Transfer,
            _ => ErrorCode::Unknown,
        }
    }

    /// Link loss that the resume manager may recover from.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}
