//! Command-line argument parsing.
//!
//! Every flag is optional: unset flags fall back to `config.toml` in the
//! data directory, then to built-in defaults. See [`Settings`] for the
//! merge.
//!
//! [`Settings`]: super::settings::Settings

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// p2pshare - peer-to-peer file sharing with a certificate-issuing tracker.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    /// Directory for all persistent data (certificates, CA, downloads,
    /// logs, config.toml). Defaults to ~/.p2pshare/
    #[clap(long, global = true)]
    pub conf: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Run the tracker: registry, certificate authority, liveness probe and
    /// LAN discovery responder.
    Tracker(TrackerArgs),
    /// Run a peer with an interactive command prompt.
    Peer(PeerArgs),
}

#[derive(clap::Args, Clone, Debug, Default)]
pub struct TrackerArgs {
    /// Interface to bind.
    #[clap(long)]
    pub host: Option<String>,

    /// Registry port (mutual TLS).
    #[clap(short, long)]
    pub port: Option<u16>,

    /// Certificate enrollment port (server-authenticated TLS).
    #[clap(long)]
    pub enroll_port: Option<u16>,

    /// UDP port answering LAN discovery.
    #[clap(long)]
    pub discovery_port: Option<u16>,

    /// Do not answer LAN discovery.
    #[clap(long)]
    pub no_discovery: bool,
}

#[derive(clap::Args, Clone, Debug, Default)]
pub struct PeerArgs {
    /// Display name announced to the tracker.
    #[clap(long)]
    pub name: Option<String>,

    /// Interface the peer service binds to.
    #[clap(long)]
    pub host: Option<String>,

    /// Host announced to the tracker. Defaults to the address the tracker
    /// sees the connection from.
    #[clap(long)]
    pub advertise: Option<String>,

    /// Peer service port. 0 = OS-assigned.
    #[clap(short, long)]
    pub port: Option<u16>,

    /// Tracker registry address (host:port). Discovered on the LAN when
    /// omitted.
    #[clap(long)]
    pub tracker: Option<String>,

    /// Tracker enrollment port, on the tracker host.
    #[clap(long)]
    pub enroll_port: Option<u16>,

    /// Where downloads are saved.
    #[clap(long)]
    pub downloads: Option<PathBuf>,
}

impl Args {
    pub fn load() -> Self {
        let mut args = Args::parse();
        // Resolve before anything can change the working directory.
        args.conf = args.conf.map(resolve_path);
        if let Command::Peer(peer) = &mut args.command {
            peer.downloads = peer.downloads.take().map(resolve_path);
        }
        args
    }
}

fn resolve_path(p: PathBuf) -> PathBuf {
    if p.is_absolute() {
        p
    } else {
        std::env::current_dir().unwrap_or_default().join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer_subcommand_with_global_flags() {
        let args = Args::try_parse_from([
            "p2pshare",
            "peer",
            "--tracker",
            "10.0.0.1:6001",
            "-vv",
            "--conf",
            "/tmp/p2p",
            "--name",
            "alice",
        ])
        .unwrap();
        assert_eq!(args.verbose, 2);
        assert_eq!(args.conf, Some(PathBuf::from("/tmp/p2p")));
        match args.command {
            Command::Peer(peer) => {
                assert_eq!(peer.tracker.as_deref(), Some("10.0.0.1:6001"));
                assert_eq!(peer.name.as_deref(), Some("alice"));
                assert_eq!(peer.port, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_tracker_subcommand() {
        let args = Args::try_parse_from(["p2pshare", "tracker", "-p", "7000", "--no-discovery"]).unwrap();
        match args.command {
            Command::Tracker(t) => {
                assert_eq!(t.port, Some(7000));
                assert!(t.no_discovery);
                assert_eq!(t.enroll_port, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_subcommand_is_required() {
        assert!(Args::try_parse_from(["p2pshare"]).is_err());
    }
}
