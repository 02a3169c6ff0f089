//! Direct TCP links between peers that can reach each other.
//!
//! # Handshake
//!
//! ```text
//! connector -> listener: [32 bytes: hex token ASCII]
//! listener -> connector: [1 byte: 0x01=OK, 0x00=rejected]
//! ```
//!
//! After the handshake both directions carry frames.

use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::link::TransportLink;
use crate::{LinkConfig, TransportError};

/// Timeout for the token exchange once TCP is up.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Token length in ASCII bytes.
pub const TOKEN_LEN: usize = 32;

const AUTH_OK: u8 = 0x01;
const AUTH_REJECTED: u8 = 0x00;

/// Generates a CSPRNG token as a 32-character lowercase hex string.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_LEN / 2];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Constant-time token comparison.
pub fn validate_token(received: &str, expected: &str) -> bool {
    if received.len() != expected.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in received.bytes().zip(expected.bytes()) {
        diff |= a ^ b;
    }
    diff == 0
}

/// What the connecting peer needs to reach a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectInfo {
    pub port: u16,
    pub token: String,
}

/// A bound listener waiting for one authenticated peer.
pub struct DirectListener {
    listener: TcpListener,
    token: String,
    config: LinkConfig,
}

impl DirectListener {
    /// Binds `addr` (port 0 picks an ephemeral port). A token is
    /// generated when none is given.
    pub async fn bind(
        addr: SocketAddr,
        token: Option<String>,
        config: LinkConfig,
    ) -> Result<Self, TransportError> {
        let token = token.unwrap_or_else(generate_token);
        if token.len() != TOKEN_LEN {
            return Err(TransportError::InvalidRendezvous(format!(
                "token must be {TOKEN_LEN} characters"
            )));
        }
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "direct listener bound");
        Ok(Self {
            listener,
            token,
            config,
        })
    }

    pub fn info(&self) -> Result<DirectInfo, TransportError> {
        Ok(DirectInfo {
            port: self.listener.local_addr()?.port(),
            token: self.token.clone(),
        })
    }

    /// Accepts peers until one presents the right token.
    pub async fn accept(self) -> Result<TransportLink, TransportError> {
        let deadline = tokio::time::Instant::now() + self.config.connect_timeout;
        loop {
            let (mut stream, addr) = tokio::time::timeout_at(deadline, self.listener.accept())
                .await
                .map_err(|_| TransportError::Timeout)??;

            let received = match tokio::time::timeout(AUTH_TIMEOUT, read_token(&mut stream)).await {
                Ok(Ok(t)) => t,
                Ok(Err(e)) => {
                    warn!(%addr, error = %e, "direct handshake failed");
                    continue;
                }
                Err(_) => {
                    warn!(%addr, "direct handshake timed out");
                    continue;
                }
            };

            if !validate_token(&received, &self.token) {
                warn!(%addr, "direct peer presented an invalid token");
                let _ = stream.write_u8(AUTH_REJECTED).await;
                continue;
            }

            stream.write_u8(AUTH_OK).await?;
            stream.flush().await?;
            info!(%addr, "direct peer authenticated");
            return Ok(into_link(stream, &self.config));
        }
    }
}

/// Connects to a listener and authenticates with `token`.
pub async fn connect(
    addr: SocketAddr,
    token: &str,
    config: &LinkConfig,
) -> Result<TransportLink, TransportError> {
    if token.len() != TOKEN_LEN {
        return Err(TransportError::InvalidRendezvous(format!(
            "token must be {TOKEN_LEN} characters"
        )));
    }

    let mut stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout)??;
    info!(%addr, "direct link connected");

    stream.write_all(token.as_bytes()).await?;
    stream.flush().await?;

    let reply = tokio::time::timeout(AUTH_TIMEOUT, stream.read_u8())
        .await
        .map_err(|_| TransportError::Timeout)??;
    if reply != AUTH_OK {
        return Err(TransportError::Rejected("peer rejected token".into()));
    }

    Ok(into_link(stream, config))
}

async fn read_token(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut buf = [0u8; TOKEN_LEN];
    stream.read_exact(&mut buf).await?;
    String::from_utf8(buf.to_vec())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn into_link(stream: TcpStream, config: &LinkConfig) -> TransportLink {
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    TransportLink::from_stream(reader, writer, "direct", config)
}
