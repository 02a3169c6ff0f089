//! Inbound side of a link as seen by the session drivers, plus the
//! shared way a driver winds down.

use relaydrop_protocol::{ErrorPayload, Frame, MessageType};
use relaydrop_transport::{LinkEvent, TransportError, TransportLink};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{TransferError, TransferSession, TransferStatus};

pub(crate) struct Inbox {
    rx: mpsc::UnboundedReceiver<LinkEvent>,
    last_error: Option<TransportError>,
    /// Receives key-exchange frames; they are dropped when unset.
    handshake: Option<mpsc::UnboundedSender<Frame>>,
}

impl Inbox {
    pub(crate) fn take(link: &TransportLink, session: &TransferSession) -> Result<Self, TransferError> {
        let rx = link.take_events().ok_or(TransportError::EventsTaken)?;
        Ok(Self {
            rx,
            last_error: None,
            handshake: session.handshake_sink(),
        })
    }

    /// Waits for the next data frame. `ERROR` and `CANCEL` from the peer
    /// come back as errors; key-exchange frames go to the handshake sink.
    pub(crate) async fn next(&mut self, cancel: &CancellationToken) -> Result<Frame, TransferError> {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                event = self.rx.recv() => event,
            };
            if let Some(frame) = self.handle(event)? {
                return Ok(frame);
            }
        }
    }

    /// Waits for a frame of type `expected`; anything else is a
    /// protocol violation.
    pub(crate) async fn expect(
        &mut self,
        cancel: &CancellationToken,
        expected: MessageType,
    ) -> Result<Frame, TransferError> {
        let frame = self.next(cancel).await?;
        if frame.msg_type != expected {
            return Err(TransferError::ProtocolViolation(format!(
                "expected {expected:?}, got {:?}",
                frame.msg_type
            )));
        }
        Ok(frame)
    }

    /// Like [`next`](Self::next) but returns `None` instead of waiting.
    pub(crate) fn poll(&mut self) -> Result<Option<Frame>, TransferError> {
        loop {
            let event = match self.rx.try_recv() {
                Ok(event) => Some(event),
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Disconnected) => None,
            };
            if let Some(frame) = self.handle(event)? {
                return Ok(Some(frame));
            }
        }
    }

    fn handle(&mut self, event: Option<LinkEvent>) -> Result<Option<Frame>, TransferError> {
        match event {
            Some(LinkEvent::Message(frame)) if frame.msg_type.is_handshake() => {
                let msg_type = frame.msg_type;
                let forwarded = match &self.handshake {
                    Some(sink) => sink.send(frame).is_ok(),
                    None => false,
                };
                if !forwarded {
                    trace!(?msg_type, "handshake frame dropped");
                }
                Ok(None)
            }
            Some(LinkEvent::Message(frame)) => match frame.msg_type {
                MessageType::Error => {
                    let message = ErrorPayload::decode(&frame.payload)
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "unreadable error".into());
                    Err(TransferError::Peer(message))
                }
                MessageType::Cancel => {
                    debug!("peer cancelled");
                    Err(TransferError::Cancelled)
                }
                _ => Ok(Some(frame)),
            },
            Some(LinkEvent::Error(e)) => {
                self.last_error = Some(e);
                Ok(None)
            }
            Some(LinkEvent::Disconnected) | None => Err(TransferError::Connection(
                self.last_error.take().unwrap_or(TransportError::Closed),
            )),
        }
    }
}

/// Settles the session after a driver returns.
///
/// Link loss leaves the status alone. Local or peer cancellation ends in
/// `cancelled`; any other failure notifies the peer and ends in `failed`.
pub(crate) async fn conclude<T>(
    session: &TransferSession,
    link: &TransportLink,
    result: Result<T, TransferError>,
) -> Result<T, TransferError> {
    if let Err(error) = &result {
        let id = session.id();
        match error {
            TransferError::Connection(_) => {
                warn!(transfer = %id, error = %error, "link lost");
            }
            TransferError::Cancelled | TransferError::Declined => {
                let _ = link.send(MessageType::Cancel, Vec::new()).await;
                let _ = session.transition(TransferStatus::Cancelled);
                debug!(transfer = %id, "transfer cancelled");
            }
            TransferError::Peer(_) => {
                session.record_error(error);
                let _ = session.transition(TransferStatus::Failed);
            }
            _ => {
                warn!(transfer = %id, error = %error, "transfer failed");
                let payload = ErrorPayload::new(error.wire_code(), error.to_string());
                let _ = link.send(MessageType::Error, payload.encode()).await;
                session.record_error(error);
                let _ = session.transition(TransferStatus::Failed);
            }
        }
    }
    link.close().await;
    result
}
