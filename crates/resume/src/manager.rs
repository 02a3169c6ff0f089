//! Orchestrates transfers and their recovery.
//!
//! Every transfer runs on its own task. When its link drops, the manager
//! pauses the session, writes a record and, with auto-resume on, counts
//! down before reconnecting through the [`Connector`]. Consecutive failed
//! attempts are bounded; the last one retires the record.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use relaydrop_protocol::FileInfo;
use relaydrop_protocol::compression::should_compress;
use relaydrop_transfer::{
    ChunkSet, ChunkStore, ConfirmRequest, EventBus, FileSource, PartialFile, PathSource, Role,
    SessionSnapshot, TransferError, TransferEvent, TransferSession, TransferStatus,
    checksum_source, receiver, sender,
};
use relaydrop_transport::{Connector, Rendezvous, TransportLink};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{RecordStore, ResumableTransferRecord, ResumeConfig};

/// Tracks transfers, persists their progress and resumes them after
/// connection loss.
pub struct ResumableTransferManager<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ResumableTransferManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<C> {
    connector: C,
    config: ResumeConfig,
    auto_resume: AtomicBool,
    store: RecordStore,
    bus: EventBus,
    confirm: Mutex<Option<mpsc::Sender<ConfirmRequest>>>,
    live: Mutex<HashMap<String, Live>>,
    /// Ids with a resume attempt in flight.
    resuming: Mutex<HashSet<String>>,
    /// Pending auto-resume loops, tagged so a loop only clears its own.
    countdowns: Mutex<HashMap<String, (u64, CancellationToken)>>,
    countdown_seq: AtomicU64,
}

/// A session the manager currently owns.
#[derive(Clone)]
struct Live {
    session: Arc<TransferSession>,
    rendezvous: Rendezvous,
    source: Option<Arc<dyn FileSource>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn is_active(status: TransferStatus) -> bool {
    matches!(
        status,
        TransferStatus::Negotiating | TransferStatus::Transferring | TransferStatus::Resuming
    )
}

impl<C: Connector> ResumableTransferManager<C> {
    pub fn new(connector: C, config: ResumeConfig, store: RecordStore) -> Self {
        let auto_resume = AtomicBool::new(config.auto_resume);
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                auto_resume,
                store,
                bus: EventBus::new(),
                confirm: Mutex::new(None),
                live: Mutex::new(HashMap::new()),
                resuming: Mutex::new(HashSet::new()),
                countdowns: Mutex::new(HashMap::new()),
                countdown_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Event bus carrying every managed transfer's events.
    pub fn events(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn config(&self) -> &ResumeConfig {
        &self.inner.config
    }

    /// Routes confirmation requests for incoming files to `tx`. Without
    /// one, incoming files are accepted.
    pub fn set_confirmation(&self, tx: mpsc::Sender<ConfirmRequest>) {
        *lock(&self.inner.confirm) = Some(tx);
    }

    pub fn auto_resume_enabled(&self) -> bool {
        self.inner.auto_resume.load(Ordering::Relaxed)
    }

    /// Starts sending `source` to whoever shows up at `rendezvous`.
    ///
    /// Hashes the source first, then runs the transfer in the background.
    pub async fn send_file(
        &self,
        source: Arc<dyn FileSource>,
        rendezvous: Rendezvous,
    ) -> Result<String, TransferError> {
        let hashing = source.clone();
        let checksum = tokio::task::spawn_blocking(move || checksum_source(hashing.as_ref()))
            .await
            .map_err(|e| TransferError::Storage(format!("hashing task failed: {e}")))??;
        let mut info = FileInfo::new(
            source.name(),
            source.size(),
            checksum,
            self.inner.config.chunk_size,
        )
        .map_err(|e| TransferError::Storage(format!("cannot describe file: {e}")))?;
        if !info.is_consistent() {
            return Err(TransferError::Storage(format!(
                "invalid chunk size {}",
                self.inner.config.chunk_size
            )));
        }
        info.compressed = self.inner.config.compress && should_compress(source.name());

        let id = new_transfer_id();
        let session = Arc::new(TransferSession::new(
            id.clone(),
            Role::Sender,
            Some(info),
            self.inner.bus.clone(),
        ));
        info!(transfer = %id, file = %source.name(), size = source.size(), target = %rendezvous, "send started");
        self.inner.register(Live {
            session: session.clone(),
            rendezvous,
            source: Some(source),
        });
        tokio::spawn(self.inner.clone().connect_and_run(session));
        Ok(id)
    }

    /// Starts receiving one file from `rendezvous` in the background.
    pub async fn receive_file(&self, rendezvous: Rendezvous) -> Result<String, TransferError> {
        let id = new_transfer_id();
        let session = Arc::new(TransferSession::new(
            id.clone(),
            Role::Receiver,
            None,
            self.inner.bus.clone(),
        ));
        info!(transfer = %id, target = %rendezvous, "receive started");
        self.inner.register(Live {
            session: session.clone(),
            rendezvous,
            source: None,
        });
        tokio::spawn(self.inner.clone().connect_and_run(session));
        Ok(id)
    }

    /// Continues an interrupted transfer now, stopping its countdown if
    /// one is pending.
    ///
    /// Returns once the peer is reached; the transfer itself continues in
    /// the background. A receiver record with every chunk present
    /// completes locally without connecting.
    pub async fn resume_transfer(&self, transfer_id: &str) -> Result<(), TransferError> {
        self.inner.cancel_countdown(transfer_id);
        self.inner.resume(transfer_id).await
    }

    /// Removes the record and partial data of a transfer and stops any
    /// live session or countdown for it. Unknown ids are fine.
    pub fn delete_resumable_transfer(&self, transfer_id: &str) -> Result<(), TransferError> {
        self.inner.cancel_countdown(transfer_id);
        if let Some(live) = lock(&self.inner.live).remove(transfer_id) {
            live.session.cancel();
        }
        self.inner.store.remove(transfer_id)?;
        self.inner.partial_file(transfer_id).discard()?;
        debug!(transfer = %transfer_id, "transfer deleted");
        Ok(())
    }

    /// Resumable records, newest first. Expired records are pruned along
    /// with their partial data.
    pub fn load_resumable_transfers(&self) -> Result<Vec<ResumableTransferRecord>, TransferError> {
        for expired in self.inner.store.prune_expired(Utc::now())? {
            self.inner.cancel_countdown(&expired.transfer_id);
            if expired.role == Role::Receiver
                && let Err(e) = self.inner.partial_file(&expired.transfer_id).discard()
            {
                warn!(transfer = %expired.transfer_id, error = %e, "failed to remove expired partial file");
            }
        }
        let mut records: Vec<_> = self
            .inner
            .store
            .list()
            .into_iter()
            .filter(|r| r.can_resume)
            .collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records)
    }

    /// Asks a transfer to stop. Its record is kept.
    pub fn cancel_transfer(&self, transfer_id: &str) -> Result<(), TransferError> {
        self.inner.cancel_countdown(transfer_id);
        let session = self
            .inner
            .live_session(transfer_id)
            .ok_or_else(|| TransferError::NotFound(transfer_id.to_string()))?;
        session.cancel();
        if session.status() == TransferStatus::Paused {
            // Nothing is driving a paused session.
            let _ = session.transition(TransferStatus::Cancelled);
            self.inner.checkpoint(&session);
        }
        info!(transfer = %transfer_id, "cancel requested");
        Ok(())
    }

    /// Stops every pending countdown. Records stay resumable.
    pub fn cancel_auto_resume(&self) {
        let pending: Vec<_> = lock(&self.inner.countdowns).drain().collect();
        for (id, (_, token)) in pending {
            debug!(transfer = %id, "auto-resume cancelled");
            token.cancel();
        }
    }

    pub fn toggle_auto_resume(&self, enabled: bool) {
        self.inner.auto_resume.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.cancel_auto_resume();
        }
        info!(enabled, "auto-resume toggled");
    }

    pub fn session(&self, transfer_id: &str) -> Option<SessionSnapshot> {
        self.inner.live_session(transfer_id).map(|s| s.snapshot())
    }

    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        lock(&self.inner.live)
            .values()
            .map(|l| l.session.snapshot())
            .collect()
    }
}

fn new_transfer_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Session tasks
// ---------------------------------------------------------------------------

impl<C: Connector> Inner<C> {
    fn register(&self, live: Live) {
        let id = live.session.id();
        lock(&self.live).insert(id, live);
    }

    fn live_entry(&self, id: &str) -> Option<Live> {
        lock(&self.live).get(id).cloned()
    }

    fn live_session(&self, id: &str) -> Option<Arc<TransferSession>> {
        lock(&self.live).get(id).map(|l| l.session.clone())
    }

    /// Whether `session` is still the one registered under its id.
    fn is_current(&self, id: &str, session: &Arc<TransferSession>) -> bool {
        lock(&self.live)
            .get(id)
            .is_some_and(|l| Arc::ptr_eq(&l.session, session))
    }

    fn forget(&self, id: &str, session: &Arc<TransferSession>) {
        let mut live = lock(&self.live);
        if live.get(id).is_some_and(|l| Arc::ptr_eq(&l.session, session)) {
            live.remove(id);
        }
    }

    fn partial_file(&self, id: &str) -> PartialFile {
        PartialFile::new(&self.config.partial_dir, &self.config.download_dir, id)
    }

    async fn connect_and_run(self: Arc<Self>, session: Arc<TransferSession>) {
        let id = session.id();
        let Some(live) = self.live_entry(&id) else {
            return;
        };
        let cancel = session.cancellation_token();
        let connected = tokio::select! {
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            r = self.connector.connect(&live.rendezvous) => r.map_err(TransferError::from),
        };
        match connected {
            Ok(link) => self.run_on(session, link).await,
            Err(e) => {
                warn!(transfer = %id, error = %e, "could not reach peer");
                self.settle(&session, &Err(e));
            }
        }
    }

    async fn run_on(self: Arc<Self>, session: Arc<TransferSession>, link: TransportLink) {
        let id = session.id();
        let Some(live) = self.live_entry(&id) else {
            link.close().await;
            return;
        };
        let result = match session.role() {
            Role::Sender => match &live.source {
                Some(source) => sender::run(&session, &link, source.as_ref()).await,
                None => Err(TransferError::NotResumable("source unavailable".into())),
            },
            Role::Receiver => {
                let mut store = self.partial_file(&id);
                let confirm = lock(&self.confirm).clone();
                receiver::run(&session, &link, &mut store, confirm.as_ref())
                    .await
                    .map(|_| ())
            }
        };
        self.settle(&session, &result);
    }

    /// Decides what an ended session means for its record.
    fn settle(self: &Arc<Self>, session: &Arc<TransferSession>, result: &Result<(), TransferError>) {
        let id = session.id();
        if !self.is_current(&id, session) {
            debug!(transfer = %id, "detached session ended");
            return;
        }
        match result {
            Ok(()) => {
                self.forget(&id, session);
                if let Err(e) = self.store.remove(&id) {
                    warn!(transfer = %id, error = %e, "failed to remove finished record");
                }
            }
            Err(e) if e.is_connection_loss() => self.on_connection_lost(session),
            Err(TransferError::Cancelled) => {
                let _ = session.transition(TransferStatus::Cancelled);
                self.checkpoint(session);
            }
            Err(TransferError::Declined) | Err(TransferError::ChecksumMismatch { chunk: None }) => {
                self.forget(&id, session);
                if let Err(e) = self.store.remove(&id) {
                    warn!(transfer = %id, error = %e, "failed to remove record");
                }
            }
            Err(e) => {
                warn!(transfer = %id, error = %e, "transfer failed; confirmed chunks kept");
                self.checkpoint(session);
            }
        }
    }

    fn on_connection_lost(self: &Arc<Self>, session: &Arc<TransferSession>) {
        let id = session.id();
        if session.transition(TransferStatus::Paused).is_err() {
            return;
        }
        self.bus.emit(TransferEvent::ConnectionLost {
            transfer_id: id.clone(),
        });

        let Some(record) = self.checkpoint(session) else {
            let error = TransferError::NotResumable("link lost before the file was described".into());
            session.record_error(&error);
            let _ = session.transition(TransferStatus::Failed);
            return;
        };
        info!(transfer = %id, percent = record.percent(), "connection lost; transfer paused");
        self.bus.emit(TransferEvent::ResumeAvailable {
            transfer_id: id.clone(),
            percent: record.percent(),
        });

        if record.can_resume && self.auto_resume.load(Ordering::Relaxed) {
            self.schedule_auto_resume(id);
        }
    }

    /// Writes the session's progress to its record, creating it if needed.
    fn checkpoint(&self, session: &TransferSession) -> Option<ResumableTransferRecord> {
        let id = session.id();
        let live = self.live_entry(&id)?;
        let snapshot = session.snapshot();
        let record = match self.store.get(&id) {
            Some(mut record) => {
                record.checkpoint(&snapshot);
                record
            }
            None => {
                let mut record = ResumableTransferRecord::from_snapshot(
                    &snapshot,
                    live.rendezvous.clone(),
                    self.config.record_ttl,
                )?;
                record.source_path = live
                    .source
                    .as_ref()
                    .and_then(|s| s.path().map(Path::to_path_buf));
                if record.role == Role::Receiver {
                    record.partial_path = Some(self.partial_file(&id).partial_path().to_path_buf());
                }
                record
            }
        };
        if let Err(e) = self.store.upsert(record.clone()) {
            warn!(transfer = %id, error = %e, "failed to persist transfer record");
        }
        Some(record)
    }
}

// ---------------------------------------------------------------------------
// Resume
// ---------------------------------------------------------------------------

/// Marks an id as being resumed until dropped.
struct ResumeGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl<'a> ResumeGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, id: &str) -> Result<Self, TransferError> {
        if !lock(set).insert(id.to_string()) {
            return Err(TransferError::ResumeInProgress(id.to_string()));
        }
        Ok(Self {
            set,
            id: id.to_string(),
        })
    }
}

impl Drop for ResumeGuard<'_> {
    fn drop(&mut self) {
        lock(self.set).remove(&self.id);
    }
}

impl<C: Connector> Inner<C> {
    async fn resume(self: &Arc<Self>, id: &str) -> Result<(), TransferError> {
        let _guard = ResumeGuard::acquire(&self.resuming, id)?;

        let record = self
            .store
            .get(id)
            .ok_or_else(|| TransferError::NotFound(id.to_string()))?;
        if !record.can_resume {
            return Err(TransferError::NotResumable(format!("{id} is no longer resumable")));
        }
        if record.is_expired(Utc::now()) {
            return Err(TransferError::NotResumable(format!("{id} has expired")));
        }
        let previous = self.live_entry(id);
        if previous.as_ref().is_some_and(|p| is_active(p.session.status())) {
            return Err(TransferError::ResumeInProgress(id.to_string()));
        }

        let mut chunks = record.chunks.clone();
        if record.role == Role::Receiver && !chunks.is_empty() && !self.partial_file(id).exists() {
            warn!(transfer = %id, "partial data missing; starting over");
            chunks = ChunkSet::new(record.file_info.total_chunks);
        }

        let source = match record.role {
            Role::Sender => Some(self.reopen_source(&record, previous.as_ref())?),
            Role::Receiver => None,
        };

        let session = Arc::new(TransferSession::seeded(
            id,
            record.role,
            record.file_info.clone(),
            chunks,
            record.bytes_transferred,
            self.bus.clone(),
        ));
        self.register(Live {
            session: session.clone(),
            rendezvous: record.rendezvous.clone(),
            source,
        });
        info!(transfer = %id, watermark = session.watermark(), "resuming transfer");

        if record.role == Role::Receiver && session.chunks().is_complete() {
            let mut store = self.partial_file(id);
            let result = receiver::finish_local(&session, &mut store).map(|_| ());
            self.settle(&session, &result);
            return result;
        }

        let cancel = session.cancellation_token();
        let connected = tokio::select! {
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            r = self.connector.connect(&record.rendezvous) => r.map_err(TransferError::from),
        };
        let link = match connected {
            Ok(link) => link,
            Err(e) => {
                let back_to = if matches!(e, TransferError::Cancelled) {
                    TransferStatus::Cancelled
                } else {
                    TransferStatus::Paused
                };
                let _ = session.transition(back_to);
                return Err(e);
            }
        };

        if let Err(e) = self.store.update(id, |r| r.resume_attempts = 0) {
            warn!(transfer = %id, error = %e, "failed to reset resume attempts");
        }
        tokio::spawn(self.clone().run_on(session, link));
        Ok(())
    }

    /// Source for a resumed send. Files are reopened by path so a deleted
    /// or resized file is caught before reconnecting.
    fn reopen_source(
        &self,
        record: &ResumableTransferRecord,
        previous: Option<&Live>,
    ) -> Result<Arc<dyn FileSource>, TransferError> {
        let Some(path) = &record.source_path else {
            return previous
                .and_then(|p| p.source.clone())
                .ok_or_else(|| TransferError::NotResumable("source file unknown".into()));
        };
        let source = PathSource::open(path)?;
        if source.size() != record.file_info.size {
            return Err(TransferError::NotResumable(format!(
                "{} changed size since the transfer started",
                path.display()
            )));
        }
        Ok(Arc::new(source))
    }

    fn schedule_auto_resume(self: &Arc<Self>, id: String) {
        let token = CancellationToken::new();
        let seq = self.countdown_seq.fetch_add(1, Ordering::Relaxed);
        if let Some((_, previous)) = lock(&self.countdowns).insert(id.clone(), (seq, token.clone())) {
            previous.cancel();
        }
        tokio::spawn(self.clone().auto_resume_loop(id, seq, token));
    }

    fn cancel_countdown(&self, id: &str) {
        if let Some((_, token)) = lock(&self.countdowns).remove(id) {
            token.cancel();
        }
    }

    /// Drops the countdown entry if it still belongs to loop `seq`.
    fn clear_countdown(&self, id: &str, seq: u64) {
        let mut countdowns = lock(&self.countdowns);
        if countdowns.get(id).is_some_and(|(s, _)| *s == seq) {
            countdowns.remove(id);
        }
    }

    async fn auto_resume_loop(self: Arc<Self>, id: String, seq: u64, token: CancellationToken) {
        let max = self.config.max_resume_attempts.max(1);
        let first = self.store.get(&id).map_or(0, |r| r.resume_attempts) + 1;

        for attempt in first..=max {
            if !self.countdown(&id, attempt, &token).await {
                return;
            }
            self.bus.emit(TransferEvent::Resuming {
                transfer_id: id.clone(),
                attempt,
            });
            match self.resume(&id).await {
                Ok(()) => {
                    self.clear_countdown(&id, seq);
                    return;
                }
                Err(e) if e.is_connection_loss() => {
                    warn!(transfer = %id, attempt, error = %e, "resume attempt failed");
                    if let Err(e) = self.store.update(&id, |r| r.resume_attempts = attempt) {
                        warn!(transfer = %id, error = %e, "failed to record resume attempt");
                    }
                }
                Err(e @ (TransferError::ResumeInProgress(_) | TransferError::Cancelled)) => {
                    debug!(transfer = %id, error = %e, "auto-resume stopped");
                    self.clear_countdown(&id, seq);
                    return;
                }
                Err(e) => {
                    warn!(transfer = %id, attempt, error = %e, "resume cannot continue");
                    self.retire(&id, attempt, &e);
                    self.clear_countdown(&id, seq);
                    return;
                }
            }
        }

        if token.is_cancelled() {
            return;
        }
        self.exhaust(&id, max);
        self.clear_countdown(&id, seq);
    }

    /// Emits one countdown event per second of `resume_timeout`, then
    /// waits out the attempt's backoff. Returns `false` if cancelled.
    async fn countdown(&self, id: &str, attempt: u32, token: &CancellationToken) -> bool {
        let mut remaining = self.config.resume_timeout;
        while !remaining.is_zero() {
            self.bus.emit(TransferEvent::ResumeCountdown {
                transfer_id: id.to_string(),
                attempt,
                remaining_secs: remaining.as_secs_f64().ceil() as u64,
            });
            let step = remaining.min(Duration::from_secs(1));
            tokio::select! {
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(step) => {}
            }
            remaining -= step;
        }

        let backoff = self.config.backoff_for_attempt(attempt);
        if !backoff.is_zero() {
            debug!(transfer = %id, attempt, backoff_ms = backoff.as_millis() as u64, "backing off");
            tokio::select! {
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
        !token.is_cancelled()
    }

    fn exhaust(&self, id: &str, attempts: u32) {
        warn!(transfer = %id, attempts, "giving up on resume");
        self.retire(id, attempts, &TransferError::ResumeExhausted { attempts });
    }

    /// Stops offering `id` for resume and fails its session with `error`.
    fn retire(&self, id: &str, attempts: u32, error: &TransferError) {
        if let Err(e) = self.store.update(id, |r| {
            r.can_resume = false;
            r.resume_attempts = attempts;
        }) {
            warn!(transfer = %id, error = %e, "failed to retire record");
        }
        match self.live_session(id) {
            Some(session) if !session.status().is_terminal() => {
                session.record_error(error);
                let _ = session.transition(TransferStatus::Failed);
            }
            _ => self.bus.emit(TransferEvent::Error {
                transfer_id: id.to_string(),
                kind: error.kind(),
                message: error.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use relaydrop_protocol::chunk::{encode_chunk, file_checksum};
    use relaydrop_protocol::{ErrorCode, ErrorPayload, Frame, MessageType};
    use relaydrop_transfer::{Delivered, ErrorKind, MemorySource};
    use relaydrop_transport::{ConnectFuture, LinkConfig, LinkEvent, TransportError};
    use tokio::io::{AsyncRead, ReadBuf};
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::sync::oneshot;

    use super::*;
    use crate::record::tests::sample;

    const ROOM: &str = "acid-basin-coast";

    fn room() -> Rendezvous {
        Rendezvous::Room { code: ROOM.into() }
    }

    /// Pairs connects to the same room, first come first served.
    #[derive(Clone, Default)]
    struct Switchboard {
        inner: Arc<Board>,
    }

    #[derive(Default)]
    struct Board {
        waiting: Mutex<HashMap<String, oneshot::Sender<TransportLink>>>,
        down: AtomicBool,
        connects: AtomicU64,
        /// Read budget for the waiting side of the next pairing.
        trip_after: Mutex<Option<usize>>,
    }

    impl Switchboard {
        fn has_waiter(&self) -> bool {
            !lock(&self.inner.waiting).is_empty()
        }

        fn set_down(&self, down: bool) {
            self.inner.down.store(down, Ordering::Relaxed);
        }

        fn connects(&self) -> u64 {
            self.inner.connects.load(Ordering::Relaxed)
        }

        fn trip_next(&self, bytes: usize) {
            *lock(&self.inner.trip_after) = Some(bytes);
        }

        fn link_pair(&self) -> (TransportLink, TransportLink) {
            let config = LinkConfig::default();
            let (a, b) = tokio::io::duplex(256 * 1024);
            let (a_read, a_write) = tokio::io::split(a);
            let (b_read, b_write) = tokio::io::split(b);
            let near = TransportLink::from_stream(a_read, a_write, "test", &config);
            let far = match lock(&self.inner.trip_after).take() {
                Some(budget) => TransportLink::from_stream(
                    Tripwire {
                        inner: b_read,
                        budget,
                    },
                    b_write,
                    "test",
                    &config,
                ),
                None => TransportLink::from_stream(b_read, b_write, "test", &config),
            };
            (near, far)
        }
    }

    impl Connector for Switchboard {
        fn connect<'a>(&'a self, target: &'a Rendezvous) -> ConnectFuture<'a> {
            Box::pin(async move {
                self.inner.connects.fetch_add(1, Ordering::Relaxed);
                if self.inner.down.load(Ordering::Relaxed) {
                    return Err(TransportError::Timeout);
                }
                let Rendezvous::Room { code } = target else {
                    return Err(TransportError::InvalidRendezvous("rooms only".into()));
                };
                let waiter = lock(&self.inner.waiting).remove(code);
                if let Some(waiter) = waiter {
                    let (near, far) = self.link_pair();
                    let _ = waiter.send(far);
                    return Ok(near);
                }
                let (tx, rx) = oneshot::channel();
                lock(&self.inner.waiting).insert(code.clone(), tx);
                rx.await.map_err(|_| TransportError::Closed)
            })
        }
    }

    /// Fails reads once `budget` bytes went through.
    struct Tripwire<R> {
        inner: R,
        budget: usize,
    }

    impl<R: AsyncRead + Unpin> AsyncRead for Tripwire<R> {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.budget == 0 {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "tripped")));
            }
            let before = buf.filled().len();
            let this = &mut *self;
            let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
            if poll.is_ready() {
                this.budget = this.budget.saturating_sub(buf.filled().len() - before);
            }
            poll
        }
    }

    fn test_config(dir: &Path, auto_resume: bool) -> ResumeConfig {
        ResumeConfig {
            auto_resume,
            chunk_size: 4096,
            compress: false,
            partial_dir: dir.join("partial"),
            download_dir: dir.join("downloads"),
            ..ResumeConfig::default()
        }
    }

    fn manager(board: &Switchboard, dir: &Path, auto_resume: bool) -> ResumableTransferManager<Switchboard> {
        ResumableTransferManager::new(
            board.clone(),
            test_config(dir, auto_resume),
            RecordStore::in_memory(),
        )
    }

    async fn wait_for(
        rx: &mut UnboundedReceiver<TransferEvent>,
        pred: impl Fn(&TransferEvent) -> bool,
    ) -> TransferEvent {
        tokio::time::timeout(Duration::from_secs(600), async {
            loop {
                match rx.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => {}
                    None => panic!("event bus closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never held");
    }

    async fn wait_for_waiter(board: &Switchboard) {
        while !board.has_waiter() {
            tokio::task::yield_now().await;
        }
    }

    async fn next_frame(rx: &mut UnboundedReceiver<LinkEvent>) -> Frame {
        match rx.recv().await {
            Some(LinkEvent::Message(frame)) => frame,
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resumes_after_link_drop_without_resending() {
        let tmp = tempfile::tempdir().unwrap();
        let board = Switchboard::default();
        let receiver = manager(&board, &tmp.path().join("rx"), false);
        let sender = manager(&board, &tmp.path().join("tx"), false);
        let (_, mut rx_events) = receiver.events().channel();
        let (_, mut tx_events) = sender.events().channel();
        let progress = Arc::new(Mutex::new(Vec::new()));
        let seen = progress.clone();
        receiver.events().subscribe(move |event| {
            if let TransferEvent::Progress(p) = event {
                lock(&seen).push(p.bytes_transferred);
            }
        });

        let data: Vec<u8> = (0..1_048_576u32).map(|i| (i % 251) as u8).collect();
        board.trip_next(100_000);
        let rx_id = receiver.receive_file(room()).await.unwrap();
        wait_for_waiter(&board).await;
        let tx_id = sender
            .send_file(Arc::new(MemorySource::new("big.bin", data.clone())), room())
            .await
            .unwrap();

        wait_for(&mut rx_events, |e| matches!(e, TransferEvent::ConnectionLost { .. })).await;
        wait_for(&mut tx_events, |e| matches!(e, TransferEvent::ConnectionLost { .. })).await;

        let records = receiver.load_resumable_transfers().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].transfer_id, rx_id);
        let watermark = records[0].watermark();
        assert!(
            watermark > 0 && watermark < records[0].file_info.total_chunks,
            "watermark {watermark}"
        );
        assert_eq!(receiver.session(&rx_id).unwrap().status, TransferStatus::Paused);
        assert_eq!(sender.load_resumable_transfers().unwrap().len(), 1);

        let waiting = receiver.clone();
        let id = rx_id.clone();
        let rx_resume = tokio::spawn(async move { waiting.resume_transfer(&id).await });
        wait_for_waiter(&board).await;
        sender.resume_transfer(&tx_id).await.unwrap();
        rx_resume.await.unwrap().unwrap();

        let done = wait_for(&mut rx_events, |e| matches!(e, TransferEvent::Completed { .. })).await;
        let TransferEvent::Completed {
            delivered: Some(Delivered::File(path)),
            ..
        } = done
        else {
            panic!("expected a delivered file, got {done:?}");
        };
        assert_eq!(std::fs::read(&path).unwrap(), data);
        wait_for(&mut tx_events, |e| matches!(e, TransferEvent::Completed { .. })).await;

        let bytes = lock(&progress).clone();
        assert!(bytes.windows(2).all(|w| w[0] <= w[1]), "progress went backwards");
        assert_eq!(bytes.last().copied(), Some(data.len() as u64));
        eventually(|| receiver.load_resumable_transfers().unwrap().is_empty()).await;
        eventually(|| sender.load_resumable_transfers().unwrap().is_empty()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn auto_resume_gives_up_after_max_attempts() {
        let tmp = tempfile::tempdir().unwrap();
        let board = Switchboard::default();
        board.set_down(true);
        let sender = manager(&board, tmp.path(), true);
        let (_, mut events) = sender.events().channel();

        let id = sender
            .send_file(Arc::new(MemorySource::new("a.bin", vec![7u8; 10_000])), room())
            .await
            .unwrap();

        let mut countdowns = 0;
        let mut attempts = Vec::new();
        loop {
            match wait_for(&mut events, |_| true).await {
                TransferEvent::ResumeCountdown { .. } => countdowns += 1,
                TransferEvent::Resuming { attempt, .. } => attempts.push(attempt),
                TransferEvent::Error {
                    kind: ErrorKind::ResumeExhausted,
                    ..
                } => break,
                _ => {}
            }
        }
        assert_eq!(attempts, vec![1, 2, 3]);
        assert_eq!(countdowns, 30);
        assert_eq!(board.connects(), 4);
        assert_eq!(sender.session(&id).unwrap().status, TransferStatus::Failed);
        assert!(sender.load_resumable_transfers().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(300)).await;
        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, TransferEvent::Error { .. } | TransferEvent::Resuming { .. }),
                "unexpected {event:?}"
            );
        }
        assert!(matches!(
            sender.resume_transfer(&id).await,
            Err(TransferError::NotResumable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn auto_resume_fails_when_source_is_gone() {
        let tmp = tempfile::tempdir().unwrap();
        let board = Switchboard::default();
        board.set_down(true);
        let sender = manager(&board, &tmp.path().join("state"), true);
        let (_, mut events) = sender.events().channel();

        let path = tmp.path().join("report.pdf");
        std::fs::write(&path, vec![3u8; 9000]).unwrap();
        let id = sender
            .send_file(Arc::new(PathSource::open(&path).unwrap()), room())
            .await
            .unwrap();
        wait_for(&mut events, |e| matches!(e, TransferEvent::ResumeCountdown { .. })).await;
        assert_eq!(
            sender.load_resumable_transfers().unwrap()[0].source_path.as_deref(),
            Some(path.as_path())
        );
        std::fs::remove_file(&path).unwrap();

        let failed = wait_for(&mut events, |e| matches!(e, TransferEvent::Error { .. })).await;
        assert!(matches!(failed, TransferEvent::Error { kind: ErrorKind::Io, .. }), "{failed:?}");
        assert_eq!(sender.session(&id).unwrap().status, TransferStatus::Failed);
        assert!(sender.load_resumable_transfers().unwrap().is_empty());
        assert_eq!(board.connects(), 1);

        tokio::time::sleep(Duration::from_secs(300)).await;
        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, TransferEvent::Resuming { .. } | TransferEvent::ResumeCountdown { .. }),
                "unexpected {event:?}"
            );
        }
    }

    #[tokio::test]
    async fn compression_follows_config_and_file_type() {
        let tmp = tempfile::tempdir().unwrap();
        let board = Switchboard::default();
        board.set_down(true);
        let compressing = ResumableTransferManager::new(
            board.clone(),
            ResumeConfig {
                compress: true,
                ..test_config(tmp.path(), false)
            },
            RecordStore::in_memory(),
        );
        let plain = manager(&board, tmp.path(), false);

        let flag = |m: &ResumableTransferManager<Switchboard>, id: &str| {
            m.session(id).unwrap().file_info.unwrap().compressed
        };
        let text = compressing
            .send_file(Arc::new(MemorySource::new("notes.txt", vec![b'a'; 100])), room())
            .await
            .unwrap();
        let video = compressing
            .send_file(Arc::new(MemorySource::new("clip.MP4", vec![0u8; 100])), room())
            .await
            .unwrap();
        let off = plain
            .send_file(Arc::new(MemorySource::new("notes.txt", vec![b'a'; 100])), room())
            .await
            .unwrap();

        assert!(flag(&compressing, &text));
        assert!(!flag(&compressing, &video));
        assert!(!flag(&plain, &off));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_countdown_keeps_record() {
        let tmp = tempfile::tempdir().unwrap();
        let board = Switchboard::default();
        board.set_down(true);
        let sender = manager(&board, tmp.path(), true);
        let (_, mut events) = sender.events().channel();

        let id = sender
            .send_file(Arc::new(MemorySource::new("a.bin", vec![1u8; 5000])), room())
            .await
            .unwrap();
        wait_for(&mut events, |e| matches!(e, TransferEvent::ResumeCountdown { .. })).await;
        sender.toggle_auto_resume(false);
        assert!(!sender.auto_resume_enabled());

        tokio::time::sleep(Duration::from_secs(300)).await;
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, TransferEvent::Resuming { .. }), "unexpected {event:?}");
        }
        assert_eq!(board.connects(), 1);
        let records = sender.load_resumable_transfers().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].can_resume);

        sender.cancel_transfer(&id).unwrap();
        assert_eq!(sender.session(&id).unwrap().status, TransferStatus::Cancelled);
        assert_eq!(sender.load_resumable_transfers().unwrap().len(), 1);
        assert!(matches!(
            sender.cancel_transfer("nope"),
            Err(TransferError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn corrupted_chunk_fails_but_keeps_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let board = Switchboard::default();
        let receiver = manager(&board, tmp.path(), false);
        let (_, mut events) = receiver.events().channel();

        let id = receiver.receive_file(room()).await.unwrap();
        let peer = board.connect(&room()).await.unwrap();
        let mut inbox = peer.take_events().unwrap();

        let data = vec![9u8; 10_000];
        let info = FileInfo::new("d.bin", 10_000, file_checksum(&data), 4096).unwrap();
        peer.send(MessageType::FileInfo, info.encode().unwrap()).await.unwrap();
        let ack = next_frame(&mut inbox).await;
        assert_eq!(ack.msg_type, MessageType::FileInfoAck);
        assert_eq!(ack.payload, 0u32.to_be_bytes().to_vec());

        peer.send(MessageType::Chunk, encode_chunk(0, &data[..4096])).await.unwrap();
        let mut bad = encode_chunk(1, &data[4096..8192]);
        let last = bad.len() - 1;
        bad[last] ^= 0xff;
        peer.send(MessageType::Chunk, bad).await.unwrap();

        let error = next_frame(&mut inbox).await;
        assert_eq!(error.msg_type, MessageType::Error);
        assert_eq!(ErrorPayload::decode(&error.payload).unwrap().code, ErrorCode::Hash);

        let event = wait_for(&mut events, |e| matches!(e, TransferEvent::Error { .. })).await;
        assert!(matches!(
            event,
            TransferEvent::Error {
                kind: ErrorKind::ChecksumMismatch,
                ..
            }
        ));
        eventually(|| !receiver.load_resumable_transfers().unwrap().is_empty()).await;

        let records = receiver.load_resumable_transfers().unwrap();
        assert_eq!(records[0].transfer_id, id);
        assert_eq!(records[0].watermark(), 1);
        assert_eq!(receiver.session(&id).unwrap().status, TransferStatus::Failed);
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, TransferEvent::Completed { .. }));
        }
    }

    #[tokio::test]
    async fn complete_record_finishes_without_connecting() {
        let tmp = tempfile::tempdir().unwrap();
        let board = Switchboard::default();
        board.set_down(true);
        let config = test_config(tmp.path(), false);

        let data: Vec<u8> = (0..9000u32).map(|i| (i * 7) as u8).collect();
        let info = FileInfo::new("photo.jpg", 9000, file_checksum(&data), 4096).unwrap();
        let session = TransferSession::seeded(
            "t-local",
            Role::Receiver,
            info.clone(),
            ChunkSet::with_prefix(info.total_chunks, info.total_chunks),
            9000,
            EventBus::new(),
        );
        let record =
            ResumableTransferRecord::from_snapshot(&session.snapshot(), room(), config.record_ttl)
                .unwrap();
        std::fs::create_dir_all(&config.partial_dir).unwrap();
        std::fs::write(config.partial_dir.join("t-local.part"), &data).unwrap();
        let store = RecordStore::in_memory();
        store.upsert(record).unwrap();

        let receiver = ResumableTransferManager::new(board.clone(), config, store);
        let (_, mut events) = receiver.events().channel();
        receiver.resume_transfer("t-local").await.unwrap();

        let done = wait_for(&mut events, |e| matches!(e, TransferEvent::Completed { .. })).await;
        let TransferEvent::Completed {
            delivered: Some(Delivered::File(path)),
            ..
        } = done
        else {
            panic!("expected a delivered file, got {done:?}");
        };
        assert_eq!(std::fs::read(path).unwrap(), data);
        assert_eq!(board.connects(), 0);
        assert!(receiver.load_resumable_transfers().unwrap().is_empty());
    }

    #[tokio::test]
    async fn resume_guards_and_idempotent_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let board = Switchboard::default();
        let store = RecordStore::in_memory();
        store.upsert(sample("t1", 1)).unwrap();
        let receiver = ResumableTransferManager::new(
            board.clone(),
            test_config(tmp.path(), false),
            store,
        );

        assert!(matches!(
            receiver.resume_transfer("missing").await,
            Err(TransferError::NotFound(_))
        ));

        // No peer ever shows up, so the first resume waits in connect.
        let first = {
            let receiver = receiver.clone();
            tokio::spawn(async move { receiver.resume_transfer("t1").await })
        };
        wait_for_waiter(&board).await;
        assert!(matches!(
            receiver.resume_transfer("t1").await,
            Err(TransferError::ResumeInProgress(_))
        ));

        receiver.delete_resumable_transfer("t1").unwrap();
        assert!(matches!(first.await.unwrap(), Err(TransferError::Cancelled)));
        receiver.delete_resumable_transfer("t1").unwrap();
        assert!(receiver.load_resumable_transfers().unwrap().is_empty());
        assert!(matches!(
            receiver.resume_transfer("t1").await,
            Err(TransferError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn load_prunes_expired_and_sorts_newest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), false);
        let store = RecordStore::in_memory();

        let mut old = sample("old", 1);
        old.updated_at = Utc::now() - chrono::Duration::hours(2);
        let mut new = sample("new", 1);
        new.updated_at = Utc::now() - chrono::Duration::hours(1);
        let mut expired = sample("expired", 1);
        expired.expires_at = Utc::now() - chrono::Duration::seconds(1);
        let mut retired = sample("retired", 1);
        retired.can_resume = false;
        for record in [old, new, expired, retired] {
            store.upsert(record).unwrap();
        }
        std::fs::create_dir_all(&config.partial_dir).unwrap();
        let expired_part = config.partial_dir.join("expired.part");
        std::fs::write(&expired_part, b"stale").unwrap();

        let manager = ResumableTransferManager::new(Switchboard::default(), config, store);
        let ids: Vec<_> = manager
            .load_resumable_transfers()
            .unwrap()
            .into_iter()
            .map(|r| r.transfer_id)
            .collect();
        assert_eq!(ids, vec!["new", "old"]);
        assert!(!expired_part.exists());
    }
}
