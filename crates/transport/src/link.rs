//! The transport-agnostic link handed to transfer sessions.
//!
//! Each link runs a read pump and a write pump (plus a ping pump for
//! WebSocket links). Inbound frames and lifecycle events land on a single
//! queue, consumed either through [`TransportLink::take_events`] or by
//! handlers registered with [`TransportLink::set_handlers`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use relaydrop_protocol::{Frame, MessageType};

use crate::{LinkConfig, TransportError};

/// Upper bound on how long [`TransportLink::close`] waits for queued
/// frames to reach the wire.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Something that happened on a link, in receipt order.
#[derive(Debug)]
pub enum LinkEvent {
    Message(Frame),
    /// Always followed by [`LinkEvent::Disconnected`].
    Error(TransportError),
    Disconnected,
}

/// Callbacks invoked from a dedicated dispatch task.
pub trait LinkHandlers: Send + 'static {
    fn on_message(&mut self, frame: Frame);

    fn on_error(&mut self, _error: &TransportError) {}

    fn on_disconnect(&mut self) {}
}

// ---------------------------------------------------------------------------
// Shared pump state
// ---------------------------------------------------------------------------

/// State shared between a link and its pumps.
pub(crate) struct LinkShared {
    pub(crate) id: String,
    pub(crate) cancel: CancellationToken,
    /// Cancelled by the write pump once it has stopped writing.
    pub(crate) flushed: CancellationToken,
    fired: AtomicBool,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkShared {
    pub(crate) fn new(kind: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let id = uuid::Uuid::new_v4().simple().to_string();
        let shared = Arc::new(Self {
            id: format!("{kind}-{}", &id[..8]),
            cancel: CancellationToken::new(),
            flushed: CancellationToken::new(),
            fired: AtomicBool::new(false),
            events_tx,
        });
        (shared, events_rx)
    }

    /// Queues an inbound frame unless the link has already ended.
    pub(crate) fn deliver(&self, frame: Frame) {
        if self.fired.load(Ordering::Acquire) {
            return;
        }
        trace!(link = %self.id, msg_type = ?frame.msg_type, len = frame.payload.len(), "frame received");
        let _ = self.events_tx.send(LinkEvent::Message(frame));
    }

    /// Ends the link from the pump side. Emits the error (if any) and
    /// `Disconnected` at most once per link.
    pub(crate) fn terminate(&self, error: Option<TransportError>) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        match error {
            Some(e) => {
                warn!(link = %self.id, error = %e, "link failed");
                let _ = self.events_tx.send(LinkEvent::Error(e));
            }
            None => debug!(link = %self.id, "peer closed the link"),
        }
        let _ = self.events_tx.send(LinkEvent::Disconnected);
        self.cancel.cancel();
    }

    /// Marks the link as locally closed. Returns `false` if it had
    /// already ended.
    fn mark_closed(&self) -> bool {
        !self.fired.swap(true, Ordering::AcqRel)
    }

    fn is_open(&self) -> bool {
        !self.fired.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// TransportLink
// ---------------------------------------------------------------------------

/// A bidirectional framed message link.
pub struct TransportLink {
    shared: Arc<LinkShared>,
    write_tx: mpsc::Sender<Frame>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
    handles: Vec<JoinHandle<()>>,
}

impl TransportLink {
    pub(crate) fn from_parts(
        shared: Arc<LinkShared>,
        events_rx: mpsc::UnboundedReceiver<LinkEvent>,
        write_tx: mpsc::Sender<Frame>,
        handles: Vec<JoinHandle<()>>,
    ) -> Self {
        debug!(link = %shared.id, "link established");
        Self {
            shared,
            write_tx,
            events_rx: Mutex::new(Some(events_rx)),
            handles,
        }
    }

    /// Wraps any byte stream pair in frame pumps.
    pub fn from_stream<R, W>(reader: R, writer: W, kind: &str, config: &LinkConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (shared, events_rx) = LinkShared::new(kind);
        let (write_tx, write_rx) = mpsc::channel(config.queue_capacity.max(1));

        let read_handle = tokio::spawn(crate::pumps::stream::read_pump(
            reader,
            shared.clone(),
            config.idle_timeout,
        ));
        let write_handle = tokio::spawn(crate::pumps::stream::write_pump(
            writer,
            write_rx,
            shared.clone(),
        ));

        Self::from_parts(shared, events_rx, write_tx, vec![read_handle, write_handle])
    }

    /// Two links connected back to back through an in-process pipe.
    pub fn pair(config: &LinkConfig) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (
            Self::from_stream(a_read, a_write, "pipe", config),
            Self::from_stream(b_read, b_write, "pipe", config),
        )
    }

    /// Short identifier used in logs.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Returns `false` once the link was closed or lost.
    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Queues a frame for sending. Waits while the queue is full.
    ///
    /// No retry: a frame that cannot be written surfaces as a disconnect.
    pub async fn send(&self, msg_type: MessageType, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.shared.is_open() {
            return Err(TransportError::Closed);
        }
        self.write_tx
            .send(Frame::new(msg_type, payload))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Takes the inbound event queue. Returns `None` if it was already
    /// taken or handed to [`set_handlers`](Self::set_handlers).
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Dispatches inbound events to `handlers` on a background task.
    pub fn set_handlers<H: LinkHandlers>(&self, mut handlers: H) -> Result<(), TransportError> {
        let mut rx = self.take_events().ok_or(TransportError::EventsTaken)?;
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    LinkEvent::Message(frame) => handlers.on_message(frame),
                    LinkEvent::Error(e) => handlers.on_error(&e),
                    LinkEvent::Disconnected => {
                        handlers.on_disconnect();
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    /// Closes the link, flushing queued frames first. Idempotent; a local
    /// close never produces a disconnect event.
    pub async fn close(&self) {
        if self.shared.mark_closed() {
            debug!(link = %self.shared.id, "closing link");
        }
        self.shared.cancel.cancel();
        let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, self.shared.flushed.cancelled()).await;
    }
}

/// Dropping without [`close`](TransportLink::close) stops the pumps at
/// once; frames still queued are lost.
impl Drop for TransportLink {
    fn drop(&mut self) {
        self.shared.mark_closed();
        self.shared.cancel.cancel();
        for handle in &self.handles {
            handle.abort();
        }
    }
}
