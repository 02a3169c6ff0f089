//! CLI configuration.
//!
//! Stored as TOML:
//! - Linux: `~/.config/relaydrop/config.toml`
//! - Windows: `%APPDATA%/relaydrop/config.toml`
//!
//! Every field has a default, so a partial file is fine. Command-line
//! flags override what is loaded here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use relaydrop_protocol::constants::DEFAULT_CHUNK_SIZE;
use relaydrop_protocol::room_code::DEFAULT_WORD_COUNT;
use relaydrop_resume::ResumeConfig;
use relaydrop_transport::{DEFAULT_QUEUE_CAPACITY, LinkConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// WebSocket relay used for room-code transfers.
    #[serde(default = "default_relay_url")]
    pub relay_url: String,

    /// Chunk size for outgoing files, in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,

    /// Gzip outgoing chunks unless the file type is already compressed.
    #[serde(default = "default_true")]
    pub compress: bool,

    /// Words in generated room codes.
    #[serde(default = "default_word_count")]
    pub word_count: usize,

    /// Limit for reaching the peer, in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Inactivity window in seconds (0 = never time out).
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub auto_resume: bool,

    /// Countdown before each automatic resume attempt, in seconds.
    #[serde(default = "default_resume_timeout")]
    pub resume_timeout_secs: u64,

    #[serde(default = "default_max_resume_attempts")]
    pub max_resume_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// How long an interrupted transfer stays resumable, in hours.
    #[serde(default = "default_record_ttl")]
    pub record_ttl_hours: u64,

    /// Where received files land.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Transfer records and partial downloads.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:8787".into()
}

fn default_chunk_size() -> u32 {
    DEFAULT_CHUNK_SIZE
}

fn default_word_count() -> usize {
    DEFAULT_WORD_COUNT
}

fn default_connect_timeout() -> u64 {
    300
}

fn default_idle_timeout() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn default_resume_timeout() -> u64 {
    10
}

fn default_max_resume_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    1
}

fn default_max_backoff() -> u64 {
    30
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_record_ttl() -> u64 {
    7 * 24
}

fn home_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    let var = "USERPROFILE";
    #[cfg(not(target_os = "windows"))]
    let var = "HOME";
    std::env::var_os(var)
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

fn default_download_dir() -> PathBuf {
    home_dir().join("Downloads")
}

fn default_state_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("LOCALAPPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(home_dir)
            .join("relaydrop")
    }

    #[cfg(not(target_os = "windows"))]
    {
        home_dir().join(".local").join("share").join("relaydrop")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            chunk_size: default_chunk_size(),
            compress: default_true(),
            word_count: default_word_count(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            auto_resume: default_true(),
            resume_timeout_secs: default_resume_timeout(),
            max_resume_attempts: default_max_resume_attempts(),
            initial_backoff_secs: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            backoff_factor: default_backoff_factor(),
            record_ttl_hours: default_record_ttl(),
            download_dir: default_download_dir(),
            state_dir: default_state_dir(),
        }
    }
}

impl Config {
    /// Loads configuration from `path` (or the per-user location),
    /// writing the defaults there if no file exists yet.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => config_path()?,
        };

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)?;
            tracing::debug!(path = %path.display(), "configuration loaded");
            Ok(config)
        } else {
            let config = Config::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // Restrict permissions on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            idle_timeout: (self.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.idle_timeout_secs)),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn resume_config(&self) -> ResumeConfig {
        ResumeConfig {
            auto_resume: self.auto_resume,
            resume_timeout: Duration::from_secs(self.resume_timeout_secs),
            max_resume_attempts: self.max_resume_attempts,
            initial_backoff: Duration::from_secs(self.initial_backoff_secs),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
            backoff_factor: self.backoff_factor,
            record_ttl: Duration::from_secs(self.record_ttl_hours.saturating_mul(3600)),
            chunk_size: self.chunk_size,
            compress: self.compress,
            partial_dir: self.state_dir.join("partial"),
            download_dir: self.download_dir.clone(),
        }
    }

    /// JSON file holding resumable transfer records.
    pub fn records_path(&self) -> PathBuf {
        self.state_dir.join("transfers.json")
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("relaydrop").join("config.toml"))
    }

    #[cfg(not(target_os = "windows"))]
    {
        Ok(home_dir()
            .join(".config")
            .join("relaydrop")
            .join("config.toml"))
    }
}
