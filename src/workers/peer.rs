//! Interactive peer: starts a [`PeerNode`] and drives it from stdin.
//!
//! Each line is one command. Listings are numbered; `download <n>` refers
//! to the most recent listing (`files` or `search`).

use crate::core::connection::pool::WorkerPool;
use crate::core::discovery::TrackerLocation;
use crate::core::node::{PeerConfig, PeerNode};
use crate::core::protocol::message::{AccessPolicy, FileRecord, PeerIdentity};
use crate::core::transaction::TransferTask;
use crate::utils::data_dir;
use crate::utils::sos::SignalOfStop;
use crate::workers::settings::Settings;
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Commands understood at the peer prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerCommand {
    /// `files`: re-register and list files visible to this peer.
    Files,
    /// `search <keyword>`
    Search(String),
    /// `peers`: other peers known to the tracker.
    Peers,
    /// `shared`: files this peer serves.
    Shared,
    /// `share <path> [host:port,...]`: optional allow-list restricts access.
    Share { path: PathBuf, allow: Vec<PeerIdentity> },
    /// `unshare <name>`
    Unshare(String),
    /// `download <n> [save path]`: entry `n` of the last listing.
    Download { index: usize, save: Option<PathBuf> },
    Tasks,
    Pause(u64),
    Resume(u64),
    Cancel(u64),
    /// `cleanup <id>...`
    Cleanup(Vec<u64>),
    Help,
    Quit,
}

pub const COMMAND_HELP: &[(&str, &str)] = &[
    ("files", "Refresh and list files shared with you"),
    ("search <keyword>", "Search shared files by name"),
    ("peers", "List peers known to the tracker"),
    ("shared", "List files you share"),
    ("share <path> [host:port,...]", "Share a file, optionally only with the listed peers"),
    ("unshare <name>", "Stop sharing a file"),
    ("download <n> [path]", "Download entry n of the last listing"),
    ("tasks", "Show shares and downloads"),
    ("pause <id>", "Pause a download"),
    ("resume <id>", "Resume a paused, stalled or restored download"),
    ("cancel <id>", "Cancel a task"),
    ("cleanup <id>...", "Forget finished tasks"),
    ("help", "Show available commands"),
    ("quit", "Leave the network and exit"),
];

/// Parse one input line. `None` for a blank line.
pub fn parse_command(input: &str) -> Option<Result<PeerCommand, String>> {
    let trimmed = input.trim();
    let (cmd, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (trimmed, ""),
    };
    if cmd.is_empty() {
        return None;
    }
    let parsed = match cmd {
        "files" | "ls" => Ok(PeerCommand::Files),
        "search" if !rest.is_empty() => Ok(PeerCommand::Search(rest.to_string())),
        "peers" => Ok(PeerCommand::Peers),
        "shared" => Ok(PeerCommand::Shared),
        "share" => parse_share(rest),
        "unshare" if !rest.is_empty() => Ok(PeerCommand::Unshare(rest.to_string())),
        "download" | "get" => parse_download(rest),
        "tasks" => Ok(PeerCommand::Tasks),
        "pause" => parse_id(rest).map(PeerCommand::Pause),
        "resume" => parse_id(rest).map(PeerCommand::Resume),
        "cancel" => parse_id(rest).map(PeerCommand::Cancel),
        "cleanup" => rest
            .split_whitespace()
            .map(parse_id)
            .collect::<Result<Vec<_>, _>>()
            .and_then(|ids| {
                if ids.is_empty() {
                    Err("usage: cleanup <id>...".to_string())
                } else {
                    Ok(PeerCommand::Cleanup(ids))
                }
            }),
        "help" | "?" => Ok(PeerCommand::Help),
        "quit" | "exit" => Ok(PeerCommand::Quit),
        "search" | "unshare" => Err(format!("usage: {cmd} <argument>")),
        _ => {
            warn!(event = "unknown_command", command = %cmd, "Unknown command");
            Err(format!("Unknown command: {cmd}"))
        }
    };
    Some(parsed)
}

fn parse_id(s: &str) -> Result<u64, String> {
    s.trim().parse().map_err(|_| format!("not a task id: {s:?}"))
}

fn parse_share(rest: &str) -> Result<PeerCommand, String> {
    let mut parts = rest.split_whitespace();
    let path = parts.next().ok_or("usage: share <path> [host:port,...]")?;
    let allow = match parts.next() {
        None => Vec::new(),
        Some(list) => list
            .split(',')
            .filter(|s| !s.is_empty())
            .map(parse_peer)
            .collect::<Result<_, _>>()?,
    };
    Ok(PeerCommand::Share {
        path: PathBuf::from(path),
        allow,
    })
}

fn parse_peer(s: &str) -> Result<PeerIdentity, String> {
    let (host, port) = s.rsplit_once(':').ok_or_else(|| format!("expected host:port, got {s:?}"))?;
    let port = port.parse().map_err(|_| format!("bad port in {s:?}"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok(PeerIdentity::new(host, port, ""))
}

fn parse_download(rest: &str) -> Result<PeerCommand, String> {
    let mut parts = rest.split_whitespace();
    let index = parts
        .next()
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .ok_or("usage: download <n> [path]")?;
    Ok(PeerCommand::Download {
        index,
        save: parts.next().map(PathBuf::from),
    })
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
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

pub fn format_files(files: &[FileRecord]) -> String {
    if files.is_empty() {
        return "  (none)\n".to_string();
    }
    let mut out = String::new();
    for (i, f) in files.iter().enumerate() {
        let restricted = match f.access {
            AccessPolicy::Public => "",
            AccessPolicy::Restricted(_) => " [restricted]",
        };
        let _ = writeln!(
            out,
            "  {:>3}. {}  {}  from {}{}  {}",
            i + 1,
            f.name,
            human_size(f.size),
            f.owner,
            restricted,
            &f.digest[..f.digest.len().min(12)],
        );
    }
    out
}

pub fn format_tasks(tasks: &[TransferTask]) -> String {
    if tasks.is_empty() {
        return "  (no tasks)\n".to_string();
    }
    let mut out = String::new();
    for t in tasks {
        let _ = write!(
            out,
            "  #{:<4} {:?} {:<11} {:>5.1}%  {}",
            t.id,
            t.kind,
            t.state.label(),
            t.percentage(),
            t.name
        );
        if let Some(reason) = &t.failure {
            let _ = write!(out, "  ({reason})");
        }
        out.push('\n');
    }
    out
}

fn help_text() -> String {
    let mut out = String::from("Commands:\n");
    for (cmd, desc) in COMMAND_HELP {
        let _ = writeln!(out, "  {cmd:<30} {desc}");
    }
    out
}

/// Resolve the configured tracker, if any, into registry and enrollment
/// endpoints. The enrollment service lives on the same host.
async fn tracker_location(settings: &Settings) -> Result<Option<TrackerLocation>> {
    let Some(addr) = &settings.peer.tracker else {
        return Ok(None);
    };
    let registry: SocketAddr = tokio::net::lookup_host(addr.as_str())
        .await
        .with_context(|| format!("resolve tracker {addr}"))?
        .next()
        .with_context(|| format!("tracker {addr} resolved to no address"))?;
    Ok(Some(TrackerLocation {
        registry,
        enroll: SocketAddr::new(registry.ip(), settings.peer.enroll_port),
    }))
}

/// Start the peer and serve the prompt until `quit`, end of input, or
/// `sos`.
pub async fn run(settings: Settings, sos: SignalOfStop) -> Result<()> {
    let p = &settings.peer;
    let config = PeerConfig {
        name: p.name.clone(),
        bind_host: p.host.clone(),
        advertise_host: p.advertise_host.clone(),
        port: p.port,
        tracker: tracker_location(&settings).await?,
        discovery_port: p.discovery_port,
        certs_dir: data_dir::certs_dir(),
        download_dir: p.download_dir.clone().unwrap_or_else(data_dir::downloads_dir),
        shares_file: data_dir::shares_file(),
        anchor_fingerprint: p.anchor_fingerprint.clone(),
        service_cap: p.service_cap,
        download: settings.download_config(),
    };
    let pool = WorkerPool::new(settings.worker_pool_size);
    let node = PeerNode::start(config, pool, sos.clone()).await?;

    match node.register().await {
        Ok(visible) => print!("Joined as {}\n{}", node.identity(), format_files(&visible)),
        Err(e) => println!("Could not register with the tracker: {e}"),
    }
    println!("Type `help` for commands.");

    let mut prompt = Prompt {
        node: Arc::clone(&node),
        listing: node.visible_files(),
    };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = sos.wait() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(event = "stdin_failure", error = %e, "Reading commands failed");
                break;
            }
        };
        match parse_command(&line) {
            None => continue,
            Some(Err(msg)) => println!("{msg}"),
            Some(Ok(PeerCommand::Quit)) => break,
            Some(Ok(cmd)) => print!("{}", prompt.execute(cmd).await),
        }
    }

    info!(event = "peer_shutdown", "Shutting down peer");
    node.stop().await;
    Ok(())
}

struct Prompt {
    node: Arc<PeerNode>,
    /// Last numbered listing, the target of `download <n>`.
    listing: Vec<FileRecord>,
}

impl Prompt {
    async fn execute(&mut self, cmd: PeerCommand) -> String {
        let node = &self.node;
        match cmd {
            PeerCommand::Files => match node.register().await {
                Ok(files) => {
                    self.listing = files;
                    format_files(&self.listing)
                }
                Err(e) => format!("files: {e}\n"),
            },
            PeerCommand::Search(keyword) => match node.search(&keyword).await {
                Ok(found) => {
                    self.listing = found;
                    format_files(&self.listing)
                }
                Err(e) => format!("search: {e}\n"),
            },
            PeerCommand::Peers => match node.known_peers().await {
                Ok(peers) if peers.is_empty() => "  (no other peers)\n".to_string(),
                Ok(peers) => peers.iter().map(|p| format!("  {p}\n")).collect(),
                Err(e) => format!("peers: {e}\n"),
            },
            PeerCommand::Shared => format_files(&node.shared_files()),
            PeerCommand::Share { path, allow } => {
                let access = if allow.is_empty() {
                    AccessPolicy::Public
                } else {
                    AccessPolicy::Restricted(allow)
                };
                match node.share_file(&path, access) {
                    Ok(id) => format!("Sharing {} as task #{id}\n", path.display()),
                    Err(e) => format!("share: {e}\n"),
                }
            }
            PeerCommand::Unshare(name) => match node.unshare(&name).await {
                Ok(true) => format!("Stopped sharing {name}\n"),
                Ok(false) => format!("{name} is not shared\n"),
                Err(e) => format!("unshare: {e}\n"),
            },
            PeerCommand::Download { index, save } => {
                let Some(file) = self.listing.get(index - 1).cloned() else {
                    return format!("No entry {index} in the last listing\n");
                };
                match node.download(file, save).await {
                    Ok(id) => format!("Download started as task #{id}\n"),
                    Err(e) => format!("download: {e}\n"),
                }
            }
            PeerCommand::Tasks => format_tasks(&node.tasks()),
            PeerCommand::Pause(id) => match node.pause_task(id) {
                Ok(()) => format!("Paused #{id}\n"),
                Err(e) => format!("pause: {e}\n"),
            },
            PeerCommand::Resume(id) => match node.resume_task(id).await {
                Ok(()) => format!("Resumed #{id}\n"),
                Err(e) => format!("resume: {e}\n"),
            },
            PeerCommand::Cancel(id) => match node.cancel_task(id) {
                Ok(()) => format!("Cancelled #{id}\n"),
                Err(e) => format!("cancel: {e}\n"),
            },
            PeerCommand::Cleanup(ids) => {
                let removed = node.cleanup_tasks(&ids).await;
                format!("Removed {} task(s)\n", removed.len())
            }
            PeerCommand::Help => help_text(),
            PeerCommand::Quit => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_line_is_not_a_command() {
        assert!(parse_command("").is_none());
        assert!(parse_command("   ").is_none());
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(parse_command("files"), Some(Ok(PeerCommand::Files)));
        assert_eq!(parse_command("  tasks  "), Some(Ok(PeerCommand::Tasks)));
        assert_eq!(parse_command("quit"), Some(Ok(PeerCommand::Quit)));
        assert_eq!(parse_command("pause 7"), Some(Ok(PeerCommand::Pause(7))));
        assert_eq!(parse_command("search annual report"), Some(Ok(PeerCommand::Search("annual report".into()))));
    }

    #[test]
    fn test_share_with_allow_list() {
        let parsed = parse_command("share /tmp/a.bin 10.0.0.2:5000,[::1]:5001").unwrap().unwrap();
        let PeerCommand::Share { path, allow } = parsed else {
            panic!("expected share");
        };
        assert_eq!(path, PathBuf::from("/tmp/a.bin"));
        assert_eq!(allow, vec![PeerIdentity::new("10.0.0.2", 5000, ""), PeerIdentity::new("::1", 5001, "")]);
        assert!(matches!(parse_command("share /tmp/a.bin nohost"), Some(Err(_))));
    }

    #[test]
    fn test_download_and_cleanup_arguments() {
        assert_eq!(
            parse_command("download 2 /tmp/out.bin"),
            Some(Ok(PeerCommand::Download {
                index: 2,
                save: Some(PathBuf::from("/tmp/out.bin"))
            }))
        );
        assert!(matches!(parse_command("download 0"), Some(Err(_))));
        assert!(matches!(parse_command("download"), Some(Err(_))));
        assert_eq!(parse_command("cleanup 1 2 3"), Some(Ok(PeerCommand::Cleanup(vec![1, 2, 3]))));
        assert!(matches!(parse_command("cleanup"), Some(Err(_))));
        assert!(matches!(parse_command("cleanup 1 x"), Some(Err(_))));
    }

    #[test]
    fn test_missing_arguments_and_unknown_commands() {
        assert!(matches!(parse_command("search"), Some(Err(_))));
        assert!(matches!(parse_command("unshare"), Some(Err(_))));
        assert!(matches!(parse_command("resume abc"), Some(Err(_))));
        assert!(matches!(parse_command("frobnicate"), Some(Err(_))));
    }

    #[test]
    fn test_format_files_numbers_entries() {
        let file = FileRecord {
            name: "a.bin".into(),
            size: 3 * 1024 * 1024,
            digest: "ab".repeat(32),
            owner: PeerIdentity::new("10.0.0.2", 5000, "bob"),
            shared_by_me: false,
            access: AccessPolicy::Public,
        };
        let out = format_files(&[file]);
        assert!(out.contains("1. a.bin"));
        assert!(out.contains("3.0 MiB"));
        assert!(out.contains("10.0.0.2:5000:bob"));
        assert_eq!(format_files(&[]), "  (none)\n");
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(1536), "1.5 KiB");
    }
}
