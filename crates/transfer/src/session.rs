use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use relaydrop_protocol::{FileInfo, Frame};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::progress::{eta_secs, percent};
use crate::{
    ChunkSet, EventBus, ProgressUpdate, Role, SpeedCalculator, TransferError, TransferEvent,
    TransferStatus,
};

/// Thread-safe state of one file transfer.
///
/// Status changes go through [`transition`](Self::transition), which
/// rejects moves the lifecycle does not allow and announces accepted ones
/// on the event bus.
pub struct TransferSession {
    inner: RwLock<SessionInner>,
    cancel: CancellationToken,
    bus: EventBus,
    speed: SpeedCalculator,
    handshake: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
}

struct SessionInner {
    id: String,
    role: Role,
    file_info: Option<FileInfo>,
    chunks: ChunkSet,
    /// Bytes covered by `chunks`.
    confirmed_bytes: u64,
    /// Reported progress; never decreases.
    bytes_transferred: u64,
    status: TransferStatus,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    error: Option<String>,
}

/// Point-in-time copy of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub role: Role,
    pub status: TransferStatus,
    pub file_info: Option<FileInfo>,
    pub chunks: ChunkSet,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub percent: f64,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl TransferSession {
    /// A fresh session in `negotiating`.
    pub fn new(id: impl Into<String>, role: Role, file_info: Option<FileInfo>, bus: EventBus) -> Self {
        let chunks = ChunkSet::new(file_info.as_ref().map_or(0, |i| i.total_chunks));
        Self::build(id.into(), role, file_info, chunks, 0, TransferStatus::Negotiating, bus)
    }

    /// A session continuing earlier work, in `resuming`.
    ///
    /// `chunks` is replaced by an empty set if it does not match `info`.
    pub fn seeded(
        id: impl Into<String>,
        role: Role,
        info: FileInfo,
        chunks: ChunkSet,
        bytes_transferred: u64,
        bus: EventBus,
    ) -> Self {
        let chunks = if chunks.total() == info.total_chunks {
            chunks
        } else {
            ChunkSet::new(info.total_chunks)
        };
        Self::build(
            id.into(),
            role,
            Some(info),
            chunks,
            bytes_transferred,
            TransferStatus::Resuming,
            bus,
        )
    }

    fn build(
        id: String,
        role: Role,
        file_info: Option<FileInfo>,
        chunks: ChunkSet,
        bytes_transferred: u64,
        status: TransferStatus,
        bus: EventBus,
    ) -> Self {
        let confirmed_bytes = file_info.as_ref().map_or(0, |i| chunks.confirmed_bytes(i));
        let now = Utc::now();
        Self {
            inner: RwLock::new(SessionInner {
                id,
                role,
                file_info,
                chunks,
                confirmed_bytes,
                bytes_transferred: bytes_transferred.max(confirmed_bytes),
                status,
                created_at: now,
                last_activity_at: now,
                error: None,
            }),
            cancel: CancellationToken::new(),
            bus,
            speed: SpeedCalculator::default(),
            handshake: Mutex::new(None),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> String {
        self.read().id.clone()
    }

    pub fn role(&self) -> Role {
        self.read().role
    }

    pub fn status(&self) -> TransferStatus {
        self.read().status
    }

    pub fn file_info(&self) -> Option<FileInfo> {
        self.read().file_info.clone()
    }

    pub fn chunks(&self) -> ChunkSet {
        self.read().chunks.clone()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn error(&self) -> Option<String> {
        self.read().error.clone()
    }

    /// Forwards key-exchange frames (`PAKE_*`) arriving on this session's
    /// link to `sink` instead of dropping them. Takes effect for drivers
    /// started afterwards.
    pub fn set_handshake_sink(&self, sink: mpsc::UnboundedSender<Frame>) {
        *self.handshake.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    pub(crate) fn handshake_sink(&self) -> Option<mpsc::UnboundedSender<Frame>> {
        self.handshake
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Moves to `to`. Moving to the current status is a no-op.
    pub fn transition(&self, to: TransferStatus) -> Result<(), TransferError> {
        let id = {
            let mut s = self.write();
            if s.status == to {
                return Ok(());
            }
            if !s.status.can_transition(to) {
                return Err(TransferError::InvalidTransition { from: s.status, to });
            }
            debug!(transfer = %s.id, from = ?s.status, to = ?to, "status change");
            s.status = to;
            s.last_activity_at = Utc::now();
            s.id.clone()
        };
        self.bus.emit(TransferEvent::StatusChanged {
            transfer_id: id,
            status: to,
        });
        Ok(())
    }

    /// Records the failure message and announces it.
    pub fn record_error(&self, error: &TransferError) {
        let id = {
            let mut s = self.write();
            s.error = Some(error.to_string());
            s.id.clone()
        };
        self.bus.emit(TransferEvent::Error {
            transfer_id: id,
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    /// Installs the descriptor learned during negotiation.
    pub fn set_file_info(&self, info: FileInfo) {
        let mut s = self.write();
        if s.chunks.total() != info.total_chunks {
            s.chunks = ChunkSet::new(info.total_chunks);
        }
        s.confirmed_bytes = s.chunks.confirmed_bytes(&info);
        s.bytes_transferred = s.bytes_transferred.max(s.confirmed_bytes);
        s.file_info = Some(info);
    }

    pub fn has_chunk(&self, index: u32) -> bool {
        self.read().chunks.contains(index)
    }

    /// Marks chunk `index` done and reports progress. Returns `false` for
    /// duplicates and out-of-range indices.
    pub fn confirm_chunk(&self, index: u32) -> bool {
        let update = {
            let mut s = self.write();
            let Some(len) = s.file_info.as_ref().map(|i| i.chunk_len(index) as u64) else {
                return false;
            };
            if !s.chunks.insert(index) {
                return false;
            }
            s.confirmed_bytes += len;
            s.bytes_transferred = s.bytes_transferred.max(s.confirmed_bytes);
            s.last_activity_at = Utc::now();
            self.speed.add_sample(len);
            self.progress_of(&s)
        };
        self.bus.emit(TransferEvent::Progress(update));
        true
    }

    /// Resets the confirmed set to the prefix `[0, watermark)`.
    ///
    /// Used by the sender once the receiver states where it stands;
    /// reported progress stays where it was.
    pub fn rebase(&self, watermark: u32) {
        let mut s = self.write();
        let total = s.chunks.total();
        s.chunks = ChunkSet::with_prefix(total, watermark);
        s.confirmed_bytes = match &s.file_info {
            Some(info) => s.chunks.confirmed_bytes(info),
            None => 0,
        };
        s.bytes_transferred = s.bytes_transferred.max(s.confirmed_bytes);
    }

    /// First unconfirmed chunk index.
    pub fn watermark(&self) -> u32 {
        self.read().chunks.watermark()
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.read().bytes_transferred
    }

    pub fn percent(&self) -> f64 {
        let s = self.read();
percent(s.bytes_transferred, total_bytes(&s), is_finished(&s))
    }

    fn progress_of(&self, s: &SessionInner) -> ProgressUpdate {
        let total = total_bytes(s);
        let bytes_per_second = self.speed.bytes_per_second();
        ProgressUpdate {
            transfer_id: s.id.clone(),
            bytes_transferred: s.bytes_transferred,
            total_bytes: total,
            percent: percent(s.bytes_transferred, total, is_finished(s)),
            bytes_per_second,
            eta_secs: eta_secs(total.saturating_sub(s.bytes_transferred), bytes_per_second),
        }
    }

    /// Requests cancellation. Drivers observe it at their next step.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let s = self.read();
        let total = total_bytes(&s);
        SessionSnapshot {
            id: s.id.clone(),
            role: s.role,
            status: s.status,
            file_info: s.file_info.clone(),
            chunks: s.chunks.clone(),
            bytes_transferred: s.bytes_transferred,
            total_bytes: total,
            percent: percent(s.bytes_transferred, total, is_finished(&s)),
            created_at: s.created_at,
            last_activity_at: s.last_activity_at,
            error: s.error.clone(),
        }
    }
}

fn total_bytes(s: &SessionInner) -> u64 {
    s.file_info.as_ref().map_or(0, |i| i.size)
}

/// All chunks of a known layout are confirmed.
fn is_finished(s: &SessionInner) -> bool {
    s.chunks.total() > 0 && s.chunks.is_complete()
}
