//! Observer for transfer lifecycle events.
//!
//! An [`EventBus`] is an explicit object shared by reference; each
//! subscriber gets its own [`SubscriptionId`] and can leave without
//! disturbing others.

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;

use crate::{ErrorKind, TransferStatus};

/// What a completed receive produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivered {
    Bytes(Arc<Vec<u8>>),
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub transfer_id: String,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub percent: f64,
    pub bytes_per_second: f64,
    /// Estimated seconds left; `None` until a rate is known.
    pub eta_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    StatusChanged {
        transfer_id: String,
        status: TransferStatus,
    },
    Progress(ProgressUpdate),
    /// `delivered` is `None` on the sending side.
    Completed {
        transfer_id: String,
        file_name: String,
        delivered: Option<Delivered>,
    },
    Error {
        transfer_id: String,
        kind: ErrorKind,
        message: String,
    },
    ConnectionLost {
        transfer_id: String,
    },
    ResumeAvailable {
        transfer_id: String,
        percent: f64,
    },
    ResumeCountdown {
        transfer_id: String,
        attempt: u32,
        remaining_secs: u64,
    },
    Resuming {
        transfer_id: String,
        attempt: u32,
    },
}

impl TransferEvent {
    pub fn transfer_id(&self) -> &str {
        match self {
            Self::StatusChanged { transfer_id, .. }
            | Self::Completed { transfer_id, .. }
            | Self::Error { transfer_id, .. }
            | Self::ConnectionLost { transfer_id }
            | Self::ResumeAvailable { transfer_id, .. }
            | Self::ResumeCountdown { transfer_id, .. }
            | Self::Resuming { transfer_id, .. } => transfer_id,
            Self::Progress(p) => &p.transfer_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&TransferEvent) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    next_id: u64,
    subscribers: Vec<(SubscriptionId, Callback)>,
}

/// Fan-out of [`TransferEvent`]s to registered callbacks.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<RwLock<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback. It runs on the emitting task and must not
    /// block.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&TransferEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        inner.subscribers.push((id, Arc::new(callback)));
        id
    }

    /// Removes a subscription. Returns `false` if it was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let before = inner.subscribers.len();
        inner.subscribers.retain(|(sid, _)| *sid != id);
        inner.subscribers.len() != before
    }

    /// Subscribes an unbounded channel; events arrive in emission order.
    pub fn channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    pub fn emit(&self, event: TransferEvent) {
        // Snapshot so callbacks may (un)subscribe.
        let subscribers: Vec<Callback> = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            inner.subscribers.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for cb in subscribers {
            cb(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .len()
    }
}
