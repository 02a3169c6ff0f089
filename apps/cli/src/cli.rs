//! Command-line arguments.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::Config;

/// Resumable peer-to-peer file transfer.
#[derive(Debug, Parser)]
#[command(name = "relaydrop", version)]
pub struct Cli {
    /// Configuration file (defaults to the per-user location).
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Relay WebSocket URL.
    #[arg(long, global = true, value_name = "URL")]
    pub relay: Option<String>,

    /// Do not resume automatically after a connection loss.
    #[arg(long, global = true)]
    pub no_auto_resume: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Send a file.
    Send {
        file: PathBuf,

        #[command(flatten)]
        target: TargetArgs,

        /// Chunk size in bytes.
        #[arg(long)]
        chunk_size: Option<u32>,

        /// Words in the generated room code.
        #[arg(long)]
        words: Option<usize>,

        /// Send chunks uncompressed.
        #[arg(long)]
        no_compress: bool,
    },
    /// Receive a file.
    Receive {
        /// Room code announced by the sender.
        #[arg(required_unless_present_any = ["connect", "listen"])]
        code: Option<String>,

        #[command(flatten)]
        target: TargetArgs,

        /// Accept the incoming file without asking.
        #[arg(short, long)]
        yes: bool,

        /// Directory to save into.
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,
    },
    /// Continue an interrupted transfer.
    Resume { id: String },
    /// Show resumable transfers.
    List,
    /// Forget an interrupted transfer and its partial data.
    Delete { id: String },
}

/// Direct connection instead of the relay.
#[derive(Debug, Clone, Default, Args)]
pub struct TargetArgs {
    /// Dial a peer listening at this address.
    #[arg(long, value_name = "ADDR", conflicts_with = "listen", requires = "token")]
    pub connect: Option<SocketAddr>,

    /// Wait for the peer on this address.
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<SocketAddr>,

    /// Shared secret for direct connections.
    #[arg(long)]
    pub token: Option<String>,
}

impl Cli {
    /// Applies global flags on top of the loaded configuration.
    pub fn apply(&self, config: &mut Config) {
        if let Some(relay) = &self.relay {
            config.relay_url = relay.clone();
        }
        if self.no_auto_resume {
            config.auto_resume = false;
        }
        match &self.command {
            Command::Send {
                chunk_size,
                words,
                no_compress,
                ..
            } => {
                if let Some(size) = chunk_size {
                    config.chunk_size = *size;
                }
                if let Some(words) = words {
                    config.word_count = *words;
                }
                if *no_compress {
                    config.compress = false;
                }
            }
            Command::Receive {
                output: Some(dir), ..
            } => config.download_dir = dir.clone(),
            _ => {}
        }
    }
}
