//! Operator settings from `<data_dir>/config.toml`.
//!
//! Every field has a default, so a missing file or a partial one is fine.
//! Command-line flags override file values.

use crate::core::config::{
    CERT_VALIDITY_DAYS, DEFAULT_SERVICE_CAP, DISCOVERY_PORT, ENROLL_PORT, EVICTION_WINDOW, LIVENESS_INTERVAL,
    MAX_CHUNK_RETRIES, MAX_PARALLEL_CHUNKS, PEER_PORT, REACTOR_THREADS, STALL_TIMEOUT, TRACKER_PORT,
    WORKER_POOL_SIZE,
};
use crate::core::download::DownloadConfig;
use crate::core::tracker::TrackerConfig;
use crate::workers::args::{PeerArgs, TrackerArgs};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Verbosity when `-v` is not given.
    pub verbose: u8,
    /// Event-loop threads of the runtime.
    pub reactor_threads: usize,
    /// Cap on concurrently running blocking jobs (disk, hashing, signing).
    pub worker_pool_size: usize,
    pub tracker: TrackerSettings,
    pub peer: PeerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            verbose: 0,
            reactor_threads: REACTOR_THREADS,
            worker_pool_size: WORKER_POOL_SIZE,
            tracker: TrackerSettings::default(),
            peer: PeerSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    pub host: String,
    pub port: u16,
    pub enroll_port: u16,
    pub discovery: bool,
    pub discovery_port: u16,
    pub cert_validity_days: i64,
    pub liveness_interval_secs: u64,
    pub eviction_window_secs: u64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: TRACKER_PORT,
            enroll_port: ENROLL_PORT,
            discovery: true,
            discovery_port: DISCOVERY_PORT,
            cert_validity_days: CERT_VALIDITY_DAYS,
            liveness_interval_secs: LIVENESS_INTERVAL.as_secs(),
            eviction_window_secs: EVICTION_WINDOW.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerSettings {
    pub name: String,
    pub host: String,
    pub advertise_host: String,
    pub port: u16,
    /// Tracker registry address; LAN discovery when unset.
    pub tracker: Option<String>,
    pub enroll_port: u16,
    pub discovery_port: u16,
    pub download_dir: Option<PathBuf>,
    /// Expected SHA-256 fingerprint (hex) of the bundled root certificate.
    pub anchor_fingerprint: Option<String>,
    /// Concurrent chunk services before answering Busy.
    pub service_cap: u32,
    pub stall_timeout_secs: u64,
    pub max_parallel_chunks: usize,
    pub max_chunk_retries: u32,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            name: "peer".into(),
            host: "0.0.0.0".into(),
            advertise_host: "0.0.0.0".into(),
            port: PEER_PORT,
            tracker: None,
            enroll_port: ENROLL_PORT,
            discovery_port: DISCOVERY_PORT,
            download_dir: None,
            anchor_fingerprint: None,
            service_cap: DEFAULT_SERVICE_CAP,
            stall_timeout_secs: STALL_TIMEOUT.as_secs(),
            max_parallel_chunks: MAX_PARALLEL_CHUNKS,
            max_chunk_retries: MAX_CHUNK_RETRIES,
        }
    }
}

impl Settings {
    /// Load from `path`. A missing file yields defaults; a malformed one is
    /// an error rather than silently ignored.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parse {}", path.display()))
    }

    /// Verbosity from the command line, else from the file.
    pub fn verbosity(&self, cli: u8) -> u8 {
        if cli > 0 { cli } else { self.verbose }
    }

    pub fn apply_tracker_args(&mut self, args: &TrackerArgs) {
        let t = &mut self.tracker;
        if let Some(host) = &args.host {
            t.host = host.clone();
        }
        if let Some(port) = args.port {
            t.port = port;
        }
        if let Some(port) = args.enroll_port {
            t.enroll_port = port;
        }
        if let Some(port) = args.discovery_port {
            t.discovery_port = port;
        }
        if args.no_discovery {
            t.discovery = false;
        }
    }

    pub fn apply_peer_args(&mut self, args: &PeerArgs) {
        let p = &mut self.peer;
        if let Some(name) = &args.name {
            p.name = name.clone();
        }
        if let Some(host) = &args.host {
            p.host = host.clone();
        }
        if let Some(host) = &args.advertise {
            p.advertise_host = host.clone();
        }
        if let Some(port) = args.port {
            p.port = port;
        }
        if args.tracker.is_some() {
            p.tracker = args.tracker.clone();
        }
        if let Some(port) = args.enroll_port {
            p.enroll_port = port;
        }
        if args.downloads.is_some() {
            p.download_dir = args.downloads.clone();
        }
    }

    pub fn tracker_config(&self, ca_dir: PathBuf) -> TrackerConfig {
        let t = &self.tracker;
        let mut config = TrackerConfig::new(t.host.clone(), t.port, t.enroll_port, ca_dir, t.cert_validity_days);
        config.discovery_port = t.discovery.then_some(t.discovery_port);
        config.liveness_interval = Duration::from_secs(t.liveness_interval_secs.max(1));
        config.eviction_window = Duration::from_secs(t.eviction_window_secs);
        config
    }

    pub fn download_config(&self) -> DownloadConfig {
        let p = &self.peer;
        DownloadConfig {
            max_parallel: p.max_parallel_chunks.max(1),
            max_retries: p.max_chunk_retries,
            stall_timeout: Duration::from_secs(p.stall_timeout_secs.max(1)),
            ..DownloadConfig::default()
        }
    }
}
