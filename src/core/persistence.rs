//! Resume metadata: the durable side-record of an in-progress download.
//!
//! One JSON file per download at `<save>.part.meta`, paired with the raw
//! `<save>.part`. Written atomically after every verified chunk and on
//! pause, so it is exactly as strong as the last chunk flushed to disk.
//! Read back on restart to rebuild `Resumable` tasks.
//!
//! The peer's share list lives in a single [`ShareCatalog`] file next to
//! its certificates, rewritten whenever a share is added or removed.

use crate::core::engine::SharedFile;
use crate::core::pipeline::writer::{meta_path, part_path};
use crate::core::protocol::message::PeerIdentity;
use crate::utils::atomic_write::atomic_write;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResumeMetadata {
    pub name: String,
    pub digest: String,
    pub size: u64,
    pub chunk_size: u64,
    /// Expected checksum of every chunk, by index.
    pub chunk_digests: Vec<String>,
    pub save_path: PathBuf,
    pub part_path: PathBuf,
    pub verified_chunks: BTreeSet<u32>,
    /// Sources known when the download last ran.
    #[serde(default)]
    pub sources: Vec<PeerIdentity>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl ResumeMetadata {
    pub fn new(
        name: String,
        digest: String,
        size: u64,
        chunk_size: u64,
        chunk_digests: Vec<String>,
        save_path: &Path,
        sources: Vec<PeerIdentity>,
    ) -> Self {
        let now = Utc::now();
        Self {
            name,
            digest,
            size,
            chunk_size,
            chunk_digests,
            save_path: save_path.to_path_buf(),
            part_path: part_path(save_path),
            verified_chunks: BTreeSet::new(),
            sources,
            created_at: now,
            last_modified: now,
        }
    }

    pub fn meta_path(&self) -> PathBuf {
        meta_path(&self.save_path)
    }

    /// Whether a resume has anything to build on.
    pub fn has_progress(&self) -> bool {
        !self.verified_chunks.is_empty()
    }

    /// Bytes covered by verified chunks.
    pub fn verified_bytes(&self) -> u64 {
        self.verified_chunks
            .iter()
            .map(|&i| {
                let offset = i as u64 * self.chunk_size;
                self.size.saturating_sub(offset).min(self.chunk_size)
            })
            .sum()
    }

    /// Persist atomically, stamping `last_modified`.
    pub fn save(&mut self) -> Result<()> {
        self.last_modified = Utc::now();
        let content = serde_json::to_vec_pretty(self)?;
        atomic_write(&self.meta_path(), &content)
    }

    pub fn load(save_path: &Path) -> Result<Option<Self>> {
        let path = meta_path(save_path);
        if !path.exists() {
            return Ok(None);
        }
        Self::read(&path).map(Some)
    }

    fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read(path)?;
        serde_json::from_slice(&content)
            .with_context(|| format!("corrupt resume metadata at {}", path.display()))
    }

    /// All readable records under `dir` (non-recursive). Unreadable files
    /// are logged and skipped.
    pub fn scan(dir: &Path) -> Vec<Self> {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                debug!(event = "resume_scan_skipped", dir = %dir.display(), error = %e, "No download directory");
                return Vec::new();
            }
        };
        let mut found = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_meta = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".part.meta"));
            if !is_meta {
                continue;
            }
            match Self::read(&path) {
                Ok(meta) => found.push(meta),
                Err(e) => warn!(
                    event = "resume_metadata_unreadable",
                    path = %path.display(),
                    error = %e,
                    "Skipping resume metadata"
                ),
            }
        }
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        found
    }
}

/// Files a peer shares, so it keeps serving them after a restart.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ShareCatalog {
    pub files: Vec<SharedFile>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl ShareCatalog {
    pub fn new(files: Vec<SharedFile>) -> Self {
        Self {
            files,
            last_modified: None,
        }
    }

    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.last_modified = Some(Utc::now());
        let content = serde_json::to_vec_pretty(self)?;
        atomic_write(path, &content)
    }

    /// A missing catalog is an empty one.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read(path)?;
        serde_json::from_slice(&content).with_context(|| format!("corrupt share catalog at {}", path.display()))
    }

    /// Drop entries whose file is gone or no longer has the recorded size.
    pub fn retain_present(&mut self) {
        self.files.retain(|f| {
            let present = std::fs::metadata(&f.path).is_ok_and(|m| m.is_file() && m.len() == f.record.size);
            if !present {
                warn!(
                    event = "share_source_missing",
                    name = %f.record.name,
                    path = %f.path.display(),
                    "Shared file changed or disappeared; no longer sharing it"
                );
            }
            present
        });
    }
}
