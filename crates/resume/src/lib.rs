//! Resumable transfers.
//!
//! [`ResumableTransferManager`] owns every transfer it starts, writes a
//! [`ResumableTransferRecord`] whenever a link is lost, cancelled or fails,
//! and continues interrupted transfers either on request or after an
//! automatic countdown.

mod config;
mod error;
mod manager;
mod record;
mod store;

pub use config::ResumeConfig;
pub use error::StoreError;
pub use manager::ResumableTransferManager;
pub use record::ResumableTransferRecord;
pub use store::RecordStore;
