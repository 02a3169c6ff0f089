use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use relaydrop_protocol::constants::DEFAULT_CHUNK_SIZE;

/// Resume and storage settings for a [`ResumableTransferManager`].
///
/// [`ResumableTransferManager`]: crate::ResumableTransferManager
#[derive(Debug, Clone)]
pub struct ResumeConfig {
    /// Resume automatically after a connection loss.
    pub auto_resume: bool,
    /// Visible countdown before each automatic attempt.
    pub resume_timeout: Duration,
    /// Consecutive failed attempts before a record stops being resumable.
    pub max_resume_attempts: u32,
    /// Extra delay before the second attempt, doubled for each later one.
    pub initial_backoff: Duration,
    /// Backoff cap.
    pub max_backoff: Duration,
    pub backoff_factor: f64,
    /// How long a record stays resumable after the transfer started.
    pub record_ttl: Duration,
    pub chunk_size: u32,
    /// Gzip chunks of files whose type is not already compressed.
    pub compress: bool,
    /// Where receivers keep `.part` files.
    pub partial_dir: PathBuf,
    /// Where finished files land.
    pub download_dir: PathBuf,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            auto_resume: true,
            resume_timeout: Duration::from_secs(10),
            max_resume_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_factor: 2.0,
            record_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            chunk_size: DEFAULT_CHUNK_SIZE,
            compress: true,
            partial_dir: std::env::temp_dir().join("relaydrop").join("partial"),
            download_dir: PathBuf::from("."),
        }
    }
}

impl ResumeConfig {
    /// Backoff added after the countdown of attempt `attempt` (1-based),
    /// with ±25% jitter. The first attempt has none.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_backoff(attempt);
        if base <= 0.0 {
            return Duration::ZERO;
        }
        let offset: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        Duration::from_secs_f64((base + base * 0.25 * offset).max(0.0))
    }

    /// Backoff before jitter, in seconds.
    fn base_backoff(&self, attempt: u32) -> f64 {
        if attempt <= 1 {
            return 0.0;
        }
        let exp = attempt.saturating_sub(2).min(63) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_factor.powi(exp);
        secs.min(self.max_backoff.as_secs_f64())
    }
}
