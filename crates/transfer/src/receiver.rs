//! Receiving side of a transfer.

use relaydrop_protocol::chunk::{decode_chunk, verify_checksum};
use relaydrop_protocol::compression::decompress_chunk;
use relaydrop_protocol::{FileDigest, FileInfo, MessageType};
use relaydrop_transport::TransportLink;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::inbox::{Inbox, conclude};
use crate::{ChunkStore, Delivered, TransferError, TransferEvent, TransferSession, TransferStatus};

/// A verified, delivered file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub file_name: String,
    pub delivered: Delivered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmResponse {
    Accept,
    Decline,
}

/// Asks the local user whether to accept an incoming file.
///
/// Dropping the request without answering declines it.
#[derive(Debug)]
pub struct ConfirmRequest {
    pub transfer_id: String,
    pub file_info: FileInfo,
    respond: oneshot::Sender<ConfirmResponse>,
}

impl ConfirmRequest {
    pub fn respond(self, response: ConfirmResponse) {
        let _ = self.respond.send(response);
    }

    pub fn accept(self) {
        self.respond(ConfirmResponse::Accept);
    }

    pub fn decline(self) {
        self.respond(ConfirmResponse::Decline);
    }
}

/// Receives one file from the peer on `link` into `store`.
///
/// A session without a descriptor is a fresh receive: the incoming
/// `FILE_INFO` is adopted and, when `confirm` is given, offered to the
/// user first. A session seeded from an earlier attempt only accepts the
/// same descriptor and acknowledges its watermark so the sender skips what
/// is already stored.
///
/// Partial data is kept on every failure except a whole-file digest
/// mismatch, so confirmed chunks survive for a later resume.
pub async fn run(
    session: &TransferSession,
    link: &TransportLink,
    store: &mut dyn ChunkStore,
    confirm: Option<&mpsc::Sender<ConfirmRequest>>,
) -> Result<ReceivedFile, TransferError> {
    let result = drive(session, link, store, confirm).await;
    let result = conclude(session, link, result).await;
    if let Err(TransferError::ChecksumMismatch { chunk: None }) = &result
        && let Err(discard) = store.discard()
    {
        warn!(transfer = %session.id(), error = %discard, "failed to discard partial data");
    }
    result
}

/// Completes a session whose chunks are all stored, without a peer.
///
/// Verifies the assembled digest against the descriptor and delivers.
pub fn finish_local(
    session: &TransferSession,
    store: &mut dyn ChunkStore,
) -> Result<ReceivedFile, TransferError> {
    let info = session
        .file_info()
        .ok_or_else(|| TransferError::NotResumable("no file info recorded".into()))?;
    store.prepare(&info)?;
    let result = assemble(session, store, &info, None);
    if let Err(e) = &result {
        session.record_error(e);
        let _ = session.transition(TransferStatus::Failed);
        if matches!(e, TransferError::ChecksumMismatch { chunk: None }) {
            let _ = store.discard();
        }
    }
    result
}

async fn drive(
    session: &TransferSession,
    link: &TransportLink,
    store: &mut dyn ChunkStore,
    confirm: Option<&mpsc::Sender<ConfirmRequest>>,
) -> Result<ReceivedFile, TransferError> {
    let cancel = session.cancellation_token();
    let mut inbox = Inbox::take(link, session)?;

    let frame = inbox.expect(&cancel, MessageType::FileInfo).await?;
    let info = FileInfo::decode(&frame.payload).ok_or(TransferError::Decode("file info"))?;
    if !info.is_consistent() {
        return Err(TransferError::ProtocolViolation(format!(
            "inconsistent chunk layout: {} bytes in {} chunks of {}",
            info.size, info.total_chunks, info.chunk_size
        )));
    }

    match session.file_info() {
        Some(seeded) if seeded != info => {
            return Err(TransferError::ProtocolViolation(
                "file info differs from the interrupted transfer".into(),
            ));
        }
        Some(_) => debug!(transfer = %session.id(), "peer offered the interrupted file"),
        None => {
            if let Some(confirm) = confirm {
                ask(session, &info, confirm, &cancel).await?;
            }
            session.set_file_info(info.clone());
        }
    }

    store.prepare(&info)?;
    let watermark = session.watermark();
    session.transition(TransferStatus::Transferring)?;
    link.send(MessageType::FileInfoAck, watermark.to_be_bytes().to_vec())
        .await?;
    info!(
        transfer = %session.id(),
        file = %info.name,
        size = info.size,
        compressed = info.compressed,
        watermark,
        total = info.total_chunks,
        "receiving"
    );

    loop {
        let frame = inbox.next(&cancel).await?;
        match frame.msg_type {
            MessageType::Chunk => {
                let (header, data) =
                    decode_chunk(&frame.payload).ok_or(TransferError::Decode("chunk"))?;
                let index = header.index;
                let expected = info.chunk_len(index);
                let packed = info.compressed && header.size < expected;
                if index >= info.total_chunks || (header.size != expected && !packed) {
                    return Err(TransferError::ProtocolViolation(format!(
                        "chunk {index} of {} bytes does not fit the file layout",
                        header.size
                    )));
                }
                if !verify_checksum(data, &header.checksum) {
                    return Err(TransferError::ChecksumMismatch { chunk: Some(index) });
                }
                if session.has_chunk(index) {
                    trace!(transfer = %session.id(), index, "duplicate chunk ignored");
                    continue;
                }
                if packed {
                    let raw = decompress_chunk(data, expected)
                        .ok_or(TransferError::Decode("compressed chunk"))?;
                    store.write_chunk(info.chunk_offset(index), &raw)?;
                } else {
                    store.write_chunk(info.chunk_offset(index), data)?;
                }
                session.confirm_chunk(index);
            }
            MessageType::Done => {
                let digest: FileDigest = frame
                    .payload
                    .as_slice()
                    .try_into()
                    .map_err(|_| TransferError::Decode("done"))?;
                let received = assemble(session, store, &info, Some(&digest))?;
                if let Err(e) = link.send(MessageType::DoneAck, Vec::new()).await {
                    warn!(transfer = %session.id(), error = %e, "done ack not sent");
                }
                return Ok(received);
            }
            other => {
                return Err(TransferError::ProtocolViolation(format!(
                    "unexpected {other:?} while receiving chunks"
                )));
            }
        }
    }
}

async fn ask(
    session: &TransferSession,
    info: &FileInfo,
    confirm: &mpsc::Sender<ConfirmRequest>,
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<(), TransferError> {
    let (tx, rx) = oneshot::channel();
    let request = ConfirmRequest {
        transfer_id: session.id(),
        file_info: info.clone(),
        respond: tx,
    };
    if confirm.send(request).await.is_err() {
        return Err(TransferError::Declined);
    }
    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        r = rx => r.unwrap_or(ConfirmResponse::Decline),
    };
    match response {
        ConfirmResponse::Accept => Ok(()),
        ConfirmResponse::Decline => Err(TransferError::Declined),
    }
}

fn assemble(
    session: &TransferSession,
    store: &mut dyn ChunkStore,
    info: &FileInfo,
    announced: Option<&FileDigest>,
) -> Result<ReceivedFile, TransferError> {
    let chunks = session.chunks();
    if !chunks.is_complete() {
        return Err(TransferError::ProtocolViolation(format!(
            "done after {} of {} chunks",
            chunks.len(),
            chunks.total()
        )));
    }
    let actual = store.digest(info)?;
    if actual != info.checksum || announced.is_some_and(|d| *d != actual) {
        return Err(TransferError::ChecksumMismatch { chunk: None });
    }

    let delivered = store.finish(info)?;
    session.transition(TransferStatus::Completed)?;
    session.bus().emit(TransferEvent::Completed {
        transfer_id: session.id(),
        file_name: info.name.clone(),
        delivered: Some(delivered.clone()),
    });
    info!(transfer = %session.id(), file = %info.name, "receive complete");
    Ok(ReceivedFile {
        file_name: info.name.clone(),
        delivered,
    })
}
