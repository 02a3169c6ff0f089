//! Sending side of a transfer.

use relaydrop_protocol::MessageType;
use relaydrop_protocol::chunk::encode_chunk;
use relaydrop_protocol::compression::compress_chunk;
use relaydrop_transport::TransportLink;
use tracing::{debug, info};

use crate::inbox::{Inbox, conclude};
use crate::{FileSource, TransferError, TransferEvent, TransferSession, TransferStatus, YIELD_EVERY};

/// Streams `source` to the peer on `link`.
///
/// The session must already carry the file's descriptor. Chunks start at
/// the index the receiver acknowledges, so a resumed receiver never gets
/// data it already holds. On return the link is closed and the session
/// settled; a lost link leaves the status for the caller to handle.
pub async fn run(
    session: &TransferSession,
    link: &TransportLink,
    source: &dyn FileSource,
) -> Result<(), TransferError> {
    let result = drive(session, link, source).await;
    conclude(session, link, result).await
}

async fn drive(
    session: &TransferSession,
    link: &TransportLink,
    source: &dyn FileSource,
) -> Result<(), TransferError> {
    let info = session
        .file_info()
        .ok_or_else(|| TransferError::ProtocolViolation("sender session has no file info".into()))?;
    let cancel = session.cancellation_token();
    let mut inbox = Inbox::take(link, session)?;

    let payload = info
        .encode()
        .map_err(|e| TransferError::ProtocolViolation(e.to_string()))?;
    link.send(MessageType::FileInfo, payload).await?;

    let ack = inbox.expect(&cancel, MessageType::FileInfoAck).await?;
    let start = u32::from_be_bytes(
        ack.payload
            .as_slice()
            .try_into()
            .map_err(|_| TransferError::Decode("file info ack"))?,
    );
    if start > info.total_chunks {
        return Err(TransferError::ProtocolViolation(format!(
            "resume index {start} beyond {} chunks",
            info.total_chunks
        )));
    }

    session.transition(TransferStatus::Transferring)?;
    session.rebase(start);
    info!(
        transfer = %session.id(),
        file = %info.name,
        size = info.size,
        compressed = info.compressed,
        start,
        total = info.total_chunks,
        "sending"
    );

    for index in start..info.total_chunks {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if let Some(frame) = inbox.poll()? {
            return Err(TransferError::ProtocolViolation(format!(
                "unexpected {:?} while sending chunks",
                frame.msg_type
            )));
        }

        let data = source.read_range(info.chunk_offset(index), info.chunk_len(index))?;
        let packed = if info.compressed { compress_chunk(&data)? } else { None };
        let body = packed.as_deref().unwrap_or(data.as_slice());
        link.send(MessageType::Chunk, encode_chunk(index, body)).await?;
        session.confirm_chunk(index);

        if (index - start + 1) % YIELD_EVERY == 0 {
            tokio::task::yield_now().await;
        }
    }

    link.send(MessageType::Done, info.checksum.to_vec()).await?;
    debug!(transfer = %session.id(), "waiting for done ack");
    inbox.expect(&cancel, MessageType::DoneAck).await?;

    session.transition(TransferStatus::Completed)?;
    session.bus().emit(TransferEvent::Completed {
        transfer_id: session.id(),
        file_name: info.name.clone(),
        delivered: None,
    });
    info!(transfer = %session.id(), file = %info.name, "send complete");
    Ok(())
}
