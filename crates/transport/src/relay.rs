//! Relay links: both peers join a WebSocket room derived from the room
//! code, then exchange `Hello`/`HelloAck` so each side knows the other
//! is present before any transfer frame is sent.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info};

use relaydrop_protocol::constants::{MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use relaydrop_protocol::{ErrorPayload, Frame, MessageType, room_code};

use crate::link::{LinkShared, TransportLink};
use crate::{LinkConfig, TransportError};

/// Builds `{relay}/ws?room={room_id}` for a room code.
pub fn room_url(relay: &str, code: &str) -> String {
    format!(
        "{}/ws?room={}",
        relay.trim_end_matches('/'),
        room_code::room_id(code)
    )
}

/// Joins the relay room for `code` and waits for the peer.
///
/// Fails with [`TransportError::Timeout`] if the peer does not show up
/// within `config.connect_timeout`, and with [`TransportError::Rejected`]
/// if the relay refuses the room.
pub async fn connect(
    relay: &str,
    code: &str,
    config: &LinkConfig,
) -> Result<TransportLink, TransportError> {
    if !room_code::validate(code) {
        return Err(TransportError::InvalidRendezvous(format!(
            "malformed room code: {code}"
        )));
    }
    let url = room_url(relay, code);
    info!(%url, "joining relay room");

    match tokio::time::timeout(config.connect_timeout, connect_inner(&url, config)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout),
    }
}

async fn connect_inner(url: &str, config: &LinkConfig) -> Result<TransportLink, TransportError> {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(MAX_PAYLOAD_SIZE + 16);
    ws_config.max_frame_size = Some(MAX_PAYLOAD_SIZE + 16);

    let (mut ws, _) = tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false)
        .await
        .map_err(map_connect_error)?;

    rendezvous(&mut ws).await?;
    info!("peer joined relay room");

    Ok(spawn_ws(ws, config))
}

/// Spawns read, write and ping pumps over an established socket.
pub(crate) fn spawn_ws<S>(ws: S, config: &LinkConfig) -> TransportLink
where
    S: Stream<Item = Result<tungstenite::Message, tungstenite::Error>>
        + Sink<tungstenite::Message, Error = tungstenite::Error>
        + Unpin
        + Send
        + 'static,
{
    let (write, read) = ws.split();
    let (shared, events_rx) = LinkShared::new("relay");
    let (write_tx, write_rx) = mpsc::channel(config.queue_capacity.max(1));
    let (ctrl_tx, ctrl_rx) = mpsc::channel(8);

    let write_handle = tokio::spawn(crate::pumps::ws::write_pump(
        write,
        write_rx,
        ctrl_rx,
        shared.clone(),
    ));
    let read_handle = tokio::spawn(crate::pumps::ws::read_pump(
        read,
        shared.clone(),
        config.idle_timeout,
    ));
    let ping_handle = tokio::spawn(crate::pumps::ping::ping_pump(
        ctrl_tx,
        shared.cancel.clone(),
    ));

    TransportLink::from_parts(
        shared,
        events_rx,
        write_tx,
        vec![read_handle, write_handle, ping_handle],
    )
}

fn map_connect_error(e: tungstenite::Error) -> TransportError {
    match e {
        tungstenite::Error::Http(resp) => {
            TransportError::Rejected(format!("relay returned HTTP {}", resp.status()))
        }
        other => TransportError::Ws(other),
    }
}

fn hello(msg_type: MessageType) -> tungstenite::Message {
    tungstenite::Message::Binary(Frame::new(msg_type, vec![PROTOCOL_VERSION]).encode().into())
}

fn check_version(frame: &Frame) -> Result<(), TransportError> {
    match frame.payload.first() {
        Some(&v) if v == PROTOCOL_VERSION => Ok(()),
        Some(&v) => Err(TransportError::Rejected(format!(
            "peer speaks protocol version {v}, expected {PROTOCOL_VERSION}"
        ))),
        None => Err(TransportError::MalformedFrame),
    }
}

/// Announces this peer and waits until the other one is known to be
/// present.
///
/// Whichever side sees a `Hello` answers with `HelloAck`; seeing either
/// completes the rendezvous. Both sides may finish by receiving a
/// `Hello`, so late acks are filtered by the read pump.
pub(crate) async fn rendezvous<S>(ws: &mut S) -> Result<(), TransportError>
where
    S: Stream<Item = Result<tungstenite::Message, tungstenite::Error>>
        + Sink<tungstenite::Message, Error = tungstenite::Error>
        + Unpin,
{
    ws.send(hello(MessageType::Hello)).await?;

    while let Some(msg) = ws.next().await {
        match msg? {
            tungstenite::Message::Binary(data) => {
                let frame = Frame::decode(&data).ok_or(TransportError::MalformedFrame)?;
                match frame.msg_type {
                    MessageType::Hello => {
                        check_version(&frame)?;
                        ws.send(hello(MessageType::HelloAck)).await?;
                        return Ok(());
                    }
                    MessageType::HelloAck => {
                        check_version(&frame)?;
                        return Ok(());
                    }
                    MessageType::Error => {
                        let reason = ErrorPayload::decode(&frame.payload)
                            .map(|p| p.to_string())
                            .unwrap_or_else(|| "relay error".into());
                        return Err(TransportError::Rejected(reason));
                    }
                    other => debug!(msg_type = ?other, "ignoring frame before rendezvous"),
                }
            }
            tungstenite::Message::Close(frame) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "relay closed the room".into());
                return Err(TransportError::Rejected(reason));
            }
            _ => {}
        }
    }
    Err(TransportError::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkEvent;
    use relaydrop_protocol::ErrorCode;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Minimal relay: pairs the first two sockets and forwards
    /// everything between them.
    async fn spawn_test_relay() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (a, _) = listener.accept().await.unwrap();
            let a = tokio_tungstenite::accept_async(a).await.unwrap();
            let (b, _) = listener.accept().await.unwrap();
            let b = tokio_tungstenite::accept_async(b).await.unwrap();

            let (mut a_tx, mut a_rx) = a.split();
            let (mut b_tx, mut b_rx) = b.split();
            let ab = async move {
                while let Some(Ok(m)) = a_rx.next().await {
                    if (m.is_binary() || m.is_close()) && b_tx.send(m).await.is_err() {
                        break;
                    }
                }
            };
            let ba = async move {
                while let Some(Ok(m)) = b_rx.next().await {
                    if (m.is_binary() || m.is_close()) && a_tx.send(m).await.is_err() {
                        break;
                    }
                }
            };
            tokio::join!(ab, ba);
        });
        format!("ws://{addr}")
    }

    async fn ws_pair() -> (
        tokio_tungstenite::WebSocketStream<tokio::io::DuplexStream>,
        tokio_tungstenite::WebSocketStream<tokio::io::DuplexStream>,
    ) {
        use tokio_tungstenite::tungstenite::protocol::Role;
        let (a, b) = tokio::io::duplex(64 * 1024);
        let a = tokio_tungstenite::WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let b = tokio_tungstenite::WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (a, b)
    }

    #[test]
    fn room_url_uses_room_id() {
        let url = room_url("wss://relay.example.com/", "amber-falcon-river");
        assert_eq!(
            url,
            format!(
                "wss://relay.example.com/ws?room={}",
                room_code::room_id("amber-falcon-river")
            )
        );
    }

    #[tokio::test]
    async fn rendezvous_completes_on_both_sides() {
        let (mut a, mut b) = ws_pair().await;
        let (ra, rb) = tokio::join!(rendezvous(&mut a), rendezvous(&mut b));
        ra.unwrap();
        rb.unwrap();
    }

    #[tokio::test]
    async fn rendezvous_relay_error_is_rejection() {
        let (mut a, mut b) = ws_pair().await;
        let err = ErrorPayload::new(ErrorCode::RoomFull, "room is full").encode();
        b.send(tungstenite::Message::Binary(Frame::new(MessageType::Error, err).encode().into()))
            .await
            .unwrap();

        match rendezvous(&mut a).await {
            Err(TransportError::Rejected(reason)) => assert!(reason.contains("room is full")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn rendezvous_version_mismatch() {
        let (mut a, mut b) = ws_pair().await;
        b.send(tungstenite::Message::Binary(
            Frame::new(MessageType::Hello, vec![PROTOCOL_VERSION + 1]).encode().into(),
        ))
        .await
        .unwrap();

        assert!(matches!(
            rendezvous(&mut a).await,
            Err(TransportError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn invalid_code_rejected_before_connecting() {
        let result = connect("ws://127.0.0.1:1", "not a code", &LinkConfig::default()).await;
        assert!(matches!(result, Err(TransportError::InvalidRendezvous(_))));
    }

    #[tokio::test]
    async fn connect_times_out_without_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (s, _) = listener.accept().await.unwrap();
            let _ws = tokio_tungstenite::accept_async(s).await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let config = LinkConfig {
            connect_timeout: Duration::from_millis(200),
            ..LinkConfig::default()
        };
        let result = connect(&format!("ws://{addr}"), "amber-falcon-river", &config).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
    }

    #[tokio::test]
    async fn links_through_relay_exchange_frames() {
        let relay = spawn_test_relay().await;
        let config = LinkConfig::default();
        let code = "amber-falcon-river";

        let (a, b) = tokio::join!(connect(&relay, code, &config), connect(&relay, code, &config));
        let (a, b) = (a.unwrap(), b.unwrap());
        let mut b_rx = b.take_events().unwrap();

        a.send(MessageType::FileInfo, vec![1, 2, 3]).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), b_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            LinkEvent::Message(f) => {
                assert_eq!(f.msg_type, MessageType::FileInfo);
                assert_eq!(f.payload, vec![1, 2, 3]);
            }
            other => panic!("unexpected {other:?}"),
        }

        a.close().await;
        let event = tokio::time::timeout(Duration::from_secs(5), b_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, LinkEvent::Disconnected));
    }
}
