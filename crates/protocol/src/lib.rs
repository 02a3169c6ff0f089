//! Wire protocol for relaydrop peer-to-peer transfers.
//!
//! Contains the message frame, the fixed-width chunk header, the
//! `FileInfo` descriptor codec, the error payload, room codes and
//! per-chunk compression.
//! Every decoder returns `None` on malformed input instead of failing.

pub mod chunk;
pub mod compression;
pub mod constants;
pub mod envelope;
pub mod error_payload;
pub mod file_info;
pub mod room_code;

pub use chunk::{ChunkDigest, ChunkHeader, FileDigest, FileHasher};
pub use constants::MessageType;
pub use envelope::Frame;
pub use error_payload::{ErrorCode, ErrorPayload};
pub use file_info::FileInfo;

/// Errors produced by the protocol crate.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown message type: {0:#04x}")]
    UnknownType(u8),

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("field too long: {0}")]
    FieldTooLong(&'static str),
}
