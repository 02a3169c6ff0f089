use serde::{Deserialize, Serialize};

/// Which end of the transfer a session drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    Receiver,
}

/// Lifecycle of a transfer session.
///
/// ```text
/// negotiating -> transferring -> completed | failed | cancelled
/// transferring <-> paused
/// paused -> resuming -> transferring
/// ```
///
/// `failed` and `cancelled` are reachable from every non-terminal state.
/// A seeded session starts in `resuming`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Negotiating,
    Transferring,
    Paused,
    Resuming,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a session may move from `self` to `to`.
    pub fn can_transition(self, to: TransferStatus) -> bool {
        use TransferStatus::*;
        match (self, to) {
            (from, Failed | Cancelled) => !from.is_terminal(),
            (Negotiating, Transferring | Paused) => true,
            (Transferring, Paused | Completed) => true,
            (Paused, Transferring | Resuming) => true,
            (Resuming, Transferring | Paused | Completed) => true,
            _ => false,
        }
    }
}
