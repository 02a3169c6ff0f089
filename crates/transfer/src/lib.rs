//! Single-file transfer sessions.
//!
//! A [`TransferSession`] holds the state of one send or receive. The
//! [`sender`] and [`receiver`] drivers move it through negotiation,
//! chunk streaming and completion over a `TransportLink`, verifying every
//! chunk and the whole file on the receiving side.

mod chunk_set;
mod error;
mod events;
mod inbox;
mod progress;
pub mod receiver;
pub mod sender;
mod session;
mod source;
mod status;
mod storage;

pub use chunk_set::ChunkSet;
pub use error::{ErrorKind, TransferError};
pub use events::{Delivered, EventBus, ProgressUpdate, SubscriptionId, TransferEvent};
pub use progress::SpeedCalculator;
pub use receiver::{ConfirmRequest, ConfirmResponse, ReceivedFile};
pub use session::{SessionSnapshot, TransferSession};
pub use source::{FileSource, MemorySource, PathSource, checksum_source};
pub use status::{Role, TransferStatus};
pub use storage::{ChunkStore, MemoryStore, PartialFile};

/// The sender yields to the scheduler after this many chunks.
pub const YIELD_EVERY: u32 = 16;
