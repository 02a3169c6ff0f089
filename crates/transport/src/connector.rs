//! Rendezvous targets and the connector seam used by the resume manager.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::link::TransportLink;
use crate::{LinkConfig, TransportError, direct, relay};

/// Where to find the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rendezvous {
    /// Meet through the relay under a room code.
    Room { code: String },
    /// Dial a listening peer.
    Direct { addr: SocketAddr, token: String },
    /// Listen for one peer presenting `token`.
    Listen { bind: SocketAddr, token: String },
}

impl fmt::Display for Rendezvous {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Room { code } => write!(f, "room {code}"),
            Self::Direct { addr, .. } => write!(f, "direct {addr}"),
            Self::Listen { bind, .. } => write!(f, "listen {bind}"),
        }
    }
}

/// Boxed future returned by [`Connector::connect`].
pub type ConnectFuture<'a> =
    Pin<Box<dyn Future<Output = Result<TransportLink, TransportError>> + Send + 'a>>;

/// Produces a fresh link for a rendezvous target. Called once per
/// attempt, including every resume attempt.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, target: &'a Rendezvous) -> ConnectFuture<'a>;
}

/// Connector backed by the relay and direct TCP.
#[derive(Debug, Clone)]
pub struct DefaultConnector {
    relay_url: String,
    config: LinkConfig,
}

impl DefaultConnector {
    pub fn new(relay_url: impl Into<String>, config: LinkConfig) -> Self {
        Self {
            relay_url: relay_url.into(),
            config,
        }
    }
}

impl Connector for DefaultConnector {
    fn connect<'a>(&'a self, target: &'a Rendezvous) -> ConnectFuture<'a> {
        Box::pin(async move {
            match target {
                Rendezvous::Room { code } => relay::connect(&self.relay_url, code, &self.config).await,
                Rendezvous::Direct { addr, token } => {
                    direct::connect(*addr, token, &self.config).await
                }
                Rendezvous::Listen { bind, token } => {
                    let listener = direct::DirectListener::bind(
                        *bind,
                        Some(token.clone()),
                        self.config.clone(),
                    )
                    .await?;
                    listener.accept().await
                }
            }
        })
    }
}
