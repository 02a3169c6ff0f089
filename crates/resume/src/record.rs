use std::path::PathBuf;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use relaydrop_protocol::FileInfo;
use relaydrop_transfer::{ChunkSet, Role, SessionSnapshot};
use relaydrop_transport::Rendezvous;
use serde::{Deserialize, Serialize};

/// Durable part of a transfer, enough to continue it after the link or
/// the process went away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumableTransferRecord {
    pub transfer_id: String,
    pub role: Role,
    pub file_info: FileInfo,
    pub chunks: ChunkSet,
    pub bytes_transferred: u64,
    pub rendezvous: Rendezvous,
    /// File being sent, when it lives on disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,
    /// Receiver-side partial data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_path: Option<PathBuf>,
    pub can_resume: bool,
    /// Consecutive failed resume attempts.
    #[serde(default)]
    pub resume_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ResumableTransferRecord {
    /// Builds a record from a session snapshot. Returns `None` while the
    /// session has no descriptor yet.
    pub fn from_snapshot(
        snapshot: &SessionSnapshot,
        rendezvous: Rendezvous,
        ttl: std::time::Duration,
    ) -> Option<Self> {
        let file_info = snapshot.file_info.clone()?;
        let now = Utc::now();
        let ttl = ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::MAX);
        Some(Self {
            transfer_id: snapshot.id.clone(),
            role: snapshot.role,
            file_info,
            chunks: snapshot.chunks.clone(),
            bytes_transferred: snapshot.bytes_transferred,
            rendezvous,
            source_path: None,
            partial_path: None,
            can_resume: true,
            resume_attempts: 0,
            created_at: snapshot.created_at,
            updated_at: now,
            expires_at: snapshot.created_at.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        })
    }

    /// Refreshes the progress fields from a later snapshot of the same
    /// transfer, keeping identity and expiry.
    pub fn checkpoint(&mut self, snapshot: &SessionSnapshot) {
        if snapshot.chunks.total() == self.file_info.total_chunks {
            self.chunks = snapshot.chunks.clone();
        }
        self.bytes_transferred = self.bytes_transferred.max(snapshot.bytes_transferred);
        self.updated_at = Utc::now();
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Every chunk is confirmed.
    pub fn is_complete(&self) -> bool {
        self.chunks.is_complete()
    }

    pub fn watermark(&self) -> u32 {
        self.chunks.watermark()
    }

    pub fn percent(&self) -> f64 {
        if self.file_info.size == 0 {
            return if self.is_complete() { 100.0 } else { 0.0 };
        }
        (self.chunks.confirmed_bytes(&self.file_info) as f64 / self.file_info.size as f64 * 100.0)
            .min(100.0)
    }

    /// Checks a freshly loaded record; restores the chunk count.
    pub(crate) fn validated(mut self) -> Option<Self> {
        self.chunks = self.chunks.validated()?;
        (self.chunks.total() == self.file_info.total_chunks && self.file_info.is_consistent())
            .then_some(self)
    }
}
