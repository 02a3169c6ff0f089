//! Command execution on top of the transfer manager.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use relaydrop_protocol::room_code;
use relaydrop_resume::{RecordStore, ResumableTransferManager};
use relaydrop_transfer::{ConfirmRequest, Delivered, PathSource, TransferEvent, TransferStatus};
use relaydrop_transport::{DefaultConnector, Rendezvous, direct};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cli::{Command, TargetArgs};
use crate::config::Config;

type Manager = ResumableTransferManager<DefaultConnector>;

pub async fn run(command: Command, config: Config) -> anyhow::Result<()> {
    let connector = DefaultConnector::new(config.relay_url.clone(), config.link_config());
    let store = RecordStore::open(config.records_path())
        .with_context(|| format!("cannot open {}", config.records_path().display()))?;
    let manager = ResumableTransferManager::new(connector, config.resume_config(), store);

    match command {
        Command::Send { file, target, .. } => send(&manager, &config, &file, &target).await,
        Command::Receive {
            code, target, yes, ..
        } => receive(&manager, code, &target, yes).await,
        Command::Resume { id } => {
            let (sub, events) = manager.events().channel();
            manager.resume_transfer(&id).await?;
            println!("resuming {id}");
            let result = watch(&manager, &id, events).await;
            manager.events().unsubscribe(sub);
            result
        }
        Command::List => list(&manager),
        Command::Delete { id } => {
            manager.delete_resumable_transfer(&id)?;
            println!("deleted {id}");
            Ok(())
        }
    }
}

async fn send(
    manager: &Manager,
    config: &Config,
    file: &Path,
    target: &TargetArgs,
) -> anyhow::Result<()> {
    let source = PathSource::open(file).with_context(|| format!("cannot read {}", file.display()))?;
    let rendezvous = match direct_target(target) {
        Some(rendezvous) => rendezvous,
        None => Rendezvous::Room {
            code: room_code::generate(config.word_count),
        },
    };
    announce(&rendezvous);

    let (sub, events) = manager.events().channel();
    let id = manager.send_file(Arc::new(source), rendezvous).await?;
    info!(transfer = %id, file = %file.display(), "waiting for receiver");
    let result = watch(manager, &id, events).await;
    manager.events().unsubscribe(sub);
    result
}

async fn receive(
    manager: &Manager,
    code: Option<String>,
    target: &TargetArgs,
    yes: bool,
) -> anyhow::Result<()> {
    let rendezvous = match (direct_target(target), code) {
        (Some(rendezvous), _) => rendezvous,
        (None, Some(code)) => {
            let code = room_code::normalize(&code);
            if !room_code::validate(&code) {
                bail!("'{code}' is not a valid room code");
            }
            Rendezvous::Room { code }
        }
        (None, None) => bail!("a room code or a direct address is required"),
    };
    if matches!(rendezvous, Rendezvous::Listen { .. }) {
        announce(&rendezvous);
    }
    if !yes {
        manager.set_confirmation(prompt_confirmations());
    }

    let (sub, events) = manager.events().channel();
    let id = manager.receive_file(rendezvous).await?;
    debug!(transfer = %id, "receive started");
    let result = watch(manager, &id, events).await;
    manager.events().unsubscribe(sub);
    result
}

fn direct_target(target: &TargetArgs) -> Option<Rendezvous> {
    if let Some(addr) = target.connect {
        return Some(Rendezvous::Direct {
            addr,
            token: target.token.clone().unwrap_or_default(),
        });
    }
    target.listen.map(|bind| Rendezvous::Listen {
        bind,
        token: target.token.clone().unwrap_or_else(direct::generate_token),
    })
}

fn announce(rendezvous: &Rendezvous) {
    match rendezvous {
        Rendezvous::Room { code } => println!("room code: {code}"),
        Rendezvous::Listen { bind, token } => {
            println!("listening on {bind}");
            println!("token: {token}");
        }
        Rendezvous::Direct { addr, .. } => println!("connecting to {addr}"),
    }
}

/// Answers confirmation requests from stdin.
fn prompt_confirmations() -> mpsc::Sender<ConfirmRequest> {
    let (tx, mut rx) = mpsc::channel::<ConfirmRequest>(1);
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let question = format!(
                "accept {} ({})? [y/N] ",
                request.file_info.name,
                format_bytes(request.file_info.size)
            );
            let accepted = tokio::task::spawn_blocking(move || ask(&question))
                .await
                .unwrap_or(false);
            if accepted {
                request.accept();
            } else {
                request.decline();
            }
        }
    });
    tx
}

fn ask(question: &str) -> bool {
    eprint!("{question}");
    let _ = std::io::stderr().flush();
    let mut line = String::new();
    std::io::stdin().read_line(&mut line).is_ok()
        && matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Follows one transfer until it finishes, fails or pauses for good.
async fn watch(
    manager: &Manager,
    id: &str,
    mut events: mpsc::UnboundedReceiver<TransferEvent>,
) -> anyhow::Result<()> {
    let mut last_error: Option<String> = None;
    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                info!(transfer = %id, "interrupted");
                manager.cancel_transfer(id)?;
                continue;
            }
            event = events.recv() => event,
        };
        let Some(event) = event else {
            bail!("event stream closed");
        };
        if event.transfer_id() != id {
            continue;
        }

        match event {
            TransferEvent::Progress(p) => {
                eprint!(
                    "\r{:5.1}%  {} / {}  {}/s  eta {}   ",
                    p.percent,
                    format_bytes(p.bytes_transferred),
                    format_bytes(p.total_bytes),
                    format_bytes(p.bytes_per_second as u64),
                    format_eta(p.eta_secs)
                );
                let _ = std::io::stderr().flush();
            }
            TransferEvent::Completed {
                file_name,
                delivered,
                ..
            } => {
                eprintln!();
                match delivered {
                    Some(Delivered::File(path)) => println!("saved {}", path.display()),
                    _ => println!("sent {file_name}"),
                }
                return Ok(());
            }
            TransferEvent::Error { message, .. } => last_error = Some(message),
            TransferEvent::StatusChanged {
                status: TransferStatus::Failed,
                ..
            } => {
                eprintln!();
                bail!(last_error.unwrap_or_else(|| "transfer failed".into()));
            }
            TransferEvent::StatusChanged {
                status: TransferStatus::Cancelled,
                ..
            } => {
                eprintln!();
                bail!("transfer cancelled; continue with `relaydrop resume {id}`");
            }
            TransferEvent::ConnectionLost { .. } => {
                eprintln!();
                eprintln!("connection lost");
            }
            TransferEvent::ResumeAvailable { percent, .. } => {
                if !manager.auto_resume_enabled() {
                    bail!("paused at {percent:.1}%; continue with `relaydrop resume {id}`");
                }
            }
            TransferEvent::ResumeCountdown {
                attempt,
                remaining_secs,
                ..
            } => {
                eprint!("\rreconnecting in {remaining_secs}s (attempt {attempt})   ");
                let _ = std::io::stderr().flush();
            }
            TransferEvent::Resuming { attempt, .. } => {
                eprintln!();
                info!(transfer = %id, attempt, "reconnecting");
            }
            TransferEvent::StatusChanged { .. } => {}
        }
    }
}

fn list(manager: &Manager) -> anyhow::Result<()> {
    let records = manager.load_resumable_transfers()?;
    if records.is_empty() {
        println!("no resumable transfers");
        return Ok(());
    }
    for record in records {
        let role = match record.role {
            relaydrop_transfer::Role::Sender => "send",
            relaydrop_transfer::Role::Receiver => "recv",
        };
        println!(
            "{}  {role}  {:>5.1}%  {}  {}  {}",
            record.transfer_id,
            record.percent(),
            record.file_info.name,
            record.rendezvous,
            record.updated_at.format("%Y-%m-%d %H:%M"),
        );
    }
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn format_eta(secs: Option<u64>) -> String {
    match secs {
        None => "--:--".into(),
        Some(s) if s >= 3600 => format!("{}:{:02}:{:02}", s / 3600, s % 3600 / 60, s % 60),
        Some(s) => format!("{:02}:{:02}", s / 60, s % 60),
    }
}
