//! Message frame shared by every transport.
//!
//! ```text
//! [1 byte: message type][4 bytes BE: payload length][payload]
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ProtocolError;
use crate::constants::{FRAME_HEADER_LEN, MAX_PAYLOAD_SIZE, MessageType};

/// A typed message with an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: MessageType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            msg_type,
            payload: payload.into(),
        }
    }

    /// Creates a frame with an empty payload.
    pub fn empty(msg_type: MessageType) -> Self {
        Self::new(msg_type, Vec::new())
    }

    /// Serializes the frame into a single buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.push(self.msg_type.into());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parses a complete frame.
    ///
    /// Returns `None` for an unknown type, a length that disagrees with the
    /// buffer, or a payload above [`MAX_PAYLOAD_SIZE`].
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < FRAME_HEADER_LEN {
            return None;
        }
        let msg_type = MessageType::from_u8(data[0])?;
        let len = u32::from_be_bytes(data[1..5].try_into().ok()?) as usize;
        if len > MAX_PAYLOAD_SIZE || data.len() - FRAME_HEADER_LEN != len {
            return None;
        }
        Some(Self {
            msg_type,
            payload: data[FRAME_HEADER_LEN..].to_vec(),
        })
    }
}

/// Writes a frame to a byte stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), ProtocolError> {
    if frame.payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(frame.payload.len()));
    }
    writer.write_u8(frame.msg_type.into()).await?;
    writer.write_u32(frame.payload.len() as u32).await?;
    writer.write_all(&frame.payload).await?;
    Ok(())
}

/// Reads a frame from a byte stream.
///
/// Returns `Ok(None)` when the stream ends cleanly before a new frame.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Frame>, ProtocolError> {
    let tag = match reader.read_u8().await {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let msg_type = MessageType::from_u8(tag).ok_or(ProtocolError::UnknownType(tag))?;
    let len = reader.read_u32().await? as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Frame { msg_type, payload }))
}
