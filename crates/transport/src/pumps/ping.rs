//! WebSocket keepalive pings.

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use relaydrop_protocol::constants::WS_PING_PERIOD;

/// Sends a ping every [`WS_PING_PERIOD`] so relays keep the socket open.
pub(crate) async fn ping_pump(
    ctrl_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(WS_PING_PERIOD);
    interval.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if ctrl_tx.send(tungstenite::Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
        }
    }
}
