//! Frame pumps for byte-stream links (TCP, in-process pipes).

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use relaydrop_protocol::Frame;
use relaydrop_protocol::envelope::{read_frame, write_frame};

use super::NO_IDLE_LIMIT;
use crate::TransportError;
use crate::link::LinkShared;

/// Reads frames until the stream ends, errors, goes idle or the link is
/// cancelled.
///
/// Any inbound frame resets the idle deadline.
pub(crate) async fn read_pump<R>(mut reader: R, shared: Arc<LinkShared>, idle: Option<Duration>)
where
    R: AsyncRead + Unpin,
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

            result = read_frame(&mut reader) => {
                match result {
                    Ok(Some(frame)) => {
                        if idle.is_some() {
                            deadline.as_mut().reset(tokio::time::Instant::now() + window);
                        }
                        shared.deliver(frame);
                    }
                    Ok(None) => {
                        shared.terminate(None);
                        break;
                    }
                    Err(e) => {
                        shared.terminate(Some(e.into()));
                        break;
                    }
                }
            }
        }
    }
    trace!(link = %shared.id, "read pump stopped");
}

/// Writes queued frames. On cancellation, frames already queued are
/// still written before the stream is shut down.
pub(crate) async fn write_pump<W>(
    mut writer: W,
    mut write_rx: mpsc::Receiver<Frame>,
    shared: Arc<LinkShared>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;

            frame = write_rx.recv() => {
                match frame {
                    Some(f) => {
                        if let Err(e) = write_one(&mut writer, &f).await {
                            shared.terminate(Some(e));
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = shared.cancel.cancelled() => {
                while let Ok(f) = write_rx.try_recv() {
                    if write_one(&mut writer, &f).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
    debug!(link = %shared.id, "write pump stopped");
    shared.flushed.cancel();
}

async fn write_one<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<(), TransportError> {
    write_frame(writer, frame).await?;
    writer.flush().await?;
    Ok(())
}
