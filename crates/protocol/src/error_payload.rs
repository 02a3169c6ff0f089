//! Payload of `Error` frames: `[u16 BE code][u16 BE len][message UTF-8]`.

use serde::{Deserialize, Serialize};

/// Reason carried by an `Error` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 0,
    Version = 1,
    Auth = 2,
    Transfer = 3,
    Hash = 4,
    Cancelled = 5,
    RoomNotFound = 6,
    RoomFull = 7,
    Protocol = 8,
}

impl ErrorCode {
    pub fn from_u16(code: u16) -> Self {
        match code {
            1 => Self::Version,
            2 => Self::Auth,
            3 => Self::Transfer,
            4 => Self::Hash,
            5 => Self::Cancelled,
            6 => Self::RoomNotFound,
            7 => Self::RoomFull,
            8 => Self::Protocol,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Encodes the payload, truncating the message at a char boundary
    /// if it exceeds `u16::MAX` bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut end = self.message.len().min(u16::MAX as usize);
        while !self.message.is_char_boundary(end) {
            end -= 1;
        }
        let msg = &self.message.as_bytes()[..end];

        let mut buf = Vec::with_capacity(4 + msg.len());
        buf.extend_from_slice(&(self.code as u16).to_be_bytes());
        buf.extend_from_slice(&(msg.len() as u16).to_be_bytes());
        buf.extend_from_slice(msg);
        buf
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }
        let code = u16::from_be_bytes([data[0], data[1]]);
        let len = u16::from_be_bytes([data[2], data[3]]) as usize;
        let msg = data.get(4..4 + len)?;
        if data.len() != 4 + len {
            return None;
        }
        Some(Self {
            code: ErrorCode::from_u16(code),
            message: String::from_utf8_lossy(msg).into_owned(),
        })
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}
