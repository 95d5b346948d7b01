//! Global data directory for persistent storage.
//!
//! Defaults to `~/.p2pshare/` but can be overridden via `--conf`.
//! Initialized once at startup via `init()`; later lookups that race ahead
//! of `init()` get the default.
//!
//! Layout:
//! - `config.toml`: operator settings
//! - `certs/`: peer trust store and bundled root anchor
//! - `ca/`: tracker signing keystore
//! - `downloads/`: default download target
//! - `logs/`: file log

use anyhow::{Result, anyhow};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Initialize the global data directory.
///
/// If `custom` is `Some`, uses that path. Otherwise falls back to `~/.p2pshare/`.
pub fn init(custom: Option<&Path>) -> Result<()> {
    let dir = match custom {
        Some(p) => p.to_path_buf(),
        None => default_dir(),
    };
    std::fs::create_dir_all(&dir)?;
    DATA_DIR
        .set(dir)
        .map_err(|_| anyhow!("data directory initialized more than once"))
}

/// Returns the global data directory path.
pub fn get() -> &'static Path {
    DATA_DIR.get_or_init(default_dir)
}

pub fn certs_dir() -> PathBuf {
    get().join("certs")
}

pub fn ca_dir() -> PathBuf {
    get().join("ca")
}

pub fn downloads_dir() -> PathBuf {
    get().join("downloads")
}

pub fn shares_file() -> PathBuf {
    get().join("shares.json")
}

pub fn log_file() -> PathBuf {
    get().join("logs").join("p2pshare.log")
}

fn default_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".p2pshare")
}
