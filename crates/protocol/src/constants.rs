use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Protocol version exchanged in `Hello` frames.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default chunk size: 64 KiB.
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;

/// Largest chunk size a receiver accepts in a `FileInfo`.
pub const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;

/// Fixed width of an encoded chunk header.
pub const CHUNK_HEADER_LEN: usize = 16;

/// Bytes of the SHA-256 digest kept in each chunk header.
pub const CHUNK_CHECKSUM_LEN: usize = 8;

/// Length of a whole-file digest.
pub const FILE_CHECKSUM_LEN: usize = 32;

/// Frame header: `[type u8][len u32 BE]`.
pub const FRAME_HEADER_LEN: usize = 5;

/// Largest payload accepted in a single frame.
pub const MAX_PAYLOAD_SIZE: usize = MAX_CHUNK_SIZE as usize + CHUNK_HEADER_LEN + 64;

/// Timeout for reaching the peer through the relay.
pub const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(300);

/// Inactivity window after which a link is considered lost.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// WebSocket keepalive period.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(30);

/// Message types carried in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    HelloAck = 0x02,

    // Key exchange frames, forwarded opaquely.
    PakeMsg1 = 0x10,
    PakeMsg2 = 0x11,
    PakeConfirm = 0x12,

    FileInfo = 0x30,
    FileInfoAck = 0x31,
    Chunk = 0x40,
    Done = 0x50,
    DoneAck = 0x51,

    Error = 0xF0,
    Cancel = 0xFF,
}

impl MessageType {
    /// Maps a wire tag back to a message type.
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0x01 => Self::Hello,
            0x02 => Self::HelloAck,
            0x10 => Self::PakeMsg1,
            0x11 => Self::PakeMsg2,
            0x12 => Self::PakeConfirm,
            0x30 => Self::FileInfo,
            0x31 => Self::FileInfoAck,
            0x40 => Self::Chunk,
            0x50 => Self::Done,
            0x51 => Self::DoneAck,
            0xF0 => Self::Error,
            0xFF => Self::Cancel,
            _ => return None,
        })
    }

    /// Returns `true` for key-exchange frames the transfer drivers pass through
    /// untouched.
    pub fn is_handshake(self) -> bool {
        matches!(self, Self::PakeMsg1 | Self::PakeMsg2 | Self::PakeConfirm)
    }
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        t as u8
    }
}
