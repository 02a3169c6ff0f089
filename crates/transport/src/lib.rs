//! Framed message links for relaydrop.
//!
//! A [`TransportLink`] hides whether frames travel through a WebSocket
//! relay, a direct TCP connection or an in-process pipe. Links never
//! reconnect on their own; callers obtain a fresh link from a
//! [`Connector`].

pub mod connector;
pub mod direct;
pub mod error;
pub mod link;
mod pumps;
pub mod relay;

use std::time::Duration;

use relaydrop_protocol::constants::{IDLE_TIMEOUT, RENDEZVOUS_TIMEOUT};

pub use connector::{ConnectFuture, Connector, DefaultConnector, Rendezvous};
pub use direct::{DirectInfo, DirectListener};
pub use error::TransportError;
pub use link::{LinkEvent, LinkHandlers, TransportLink};

/// Default outbound queue depth per link.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Per-link timing and buffering.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Limit for connect plus rendezvous.
    pub connect_timeout: Duration,
    /// Inactivity window; `None` disables the check.
    pub idle_timeout: Option<Duration>,
    /// Outbound frames buffered before `send` waits.
    pub queue_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: RENDEZVOUS_TIMEOUT,
            idle_timeout: Some(IDLE_TIMEOUT),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_link_config() {
        let config = LinkConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(300));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(120)));
        assert_eq!(config.queue_capacity, 64);
    }
}
