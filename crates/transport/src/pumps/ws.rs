//! WebSocket pumps for relay links.
//!
//! Frames travel as binary WebSocket messages, one frame per message.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tracing::{debug, trace};

use relaydrop_protocol::{Frame, MessageType};

use super::NO_IDLE_LIMIT;
use crate::TransportError;
use crate::link::LinkShared;

/// Reads WebSocket messages and forwards decoded frames.
///
/// Any inbound message, control frames included, resets the idle
/// deadline. Late `Hello`/`HelloAck` frames from the rendezvous are
/// dropped.
pub(crate) async fn read_pump<S>(mut read: S, shared: Arc<LinkShared>, idle: Option<Duration>)
where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let window = idle.unwrap_or(NO_IDLE_LIMIT);
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,

            () = &mut deadline, if idle.is_some() => {
                shared.terminate(Some(TransportError::Inactive(window)));
                break;
            }

            msg = read.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        shared.terminate(Some(e.into()));
                        break;
                    }
                    None => {
                        shared.terminate(None);
                        break;
                    }
                };

                if idle.is_some() {
                    deadline.as_mut().reset(tokio::time::Instant::now() + window);
                }

                match msg {
                    tungstenite::Message::Binary(data) => match Frame::decode(&data) {
                        Some(frame) if matches!(frame.msg_type, MessageType::Hello | MessageType::HelloAck) => {
                            trace!(link = %shared.id, "dropping late rendezvous frame");
                        }
                        Some(frame) => shared.deliver(frame),
                        None => {
                            shared.terminate(Some(TransportError::MalformedFrame));
                            break;
                        }
                    },
                    tungstenite::Message::Close(frame) => {
                        debug!(link = %shared.id, ?frame, "received close frame");
                        shared.terminate(None);
                        break;
                    }
                    _ => trace!(link = %shared.id, "control message"),
                }
            }
        }
    }
}

/// Writes frames and keepalive pings to the socket.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut frame_rx: mpsc::Receiver<Frame>,
    mut ctrl_rx: mpsc::Receiver<tungstenite::Message>,
    shared: Arc<LinkShared>,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            biased;

            frame = frame_rx.recv() => {
                match frame {
                    Some(f) => {
                        let msg = tungstenite::Message::Binary(f.encode().into());
                        if let Err(e) = write.send(msg).await {
                            shared.terminate(Some(e.into()));
                            break;
                        }
                    }
                    None => break,
                }
            }

            Some(ctrl) = ctrl_rx.recv() => {
                if let Err(e) = write.send(ctrl).await {
                    shared.terminate(Some(e.into()));
                    break;
                }
            }

            _ = shared.cancel.cancelled() => {
                while let Ok(f) = frame_rx.try_recv() {
                    if write.send(tungstenite::Message::Binary(f.encode().into())).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    let _ = write.send(tungstenite::Message::Close(None)).await;
    debug!(link = %shared.id, "write pump stopped");
    shared.flushed.cancel();
}
