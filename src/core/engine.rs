//! Peer-side transfer engine: answers chunk, manifest and listing requests
//! from other peers.
//!
//! Chunk service is admitted through a [`ServiceGate`]: a counting
//! semaphore of `K` slots. A request that finds no free slot is answered
//! `Busy` immediately instead of queueing, so a downloader can move on to
//! another source. The slot travels with the [`Reply`] and is released once
//! the chunk bytes have been written to the socket.

use crate::core::connection::pool::WorkerPool;
use crate::core::connection::reactor::{ConnCtx, Reply, RequestHandler};
use crate::core::pipeline::chunk::{chunk_count, digest_chunk};
use crate::core::pipeline::writer::read_chunk;
use crate::core::protocol::message::{FileManifest, FileRecord, Request, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

// ── Share table ──────────────────────────────────────────────────────────────

/// A file this node serves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedFile {
    pub record: FileRecord,
    pub path: PathBuf,
    pub chunk_digests: Vec<String>,
}

/// Files served by this node, keyed by content digest.
#[derive(Debug, Default)]
pub struct ShareTable {
    files: RwLock<HashMap<String, SharedFile>>,
}

impl ShareTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, SharedFile>> {
        match self.files.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, SharedFile>> {
        match self.files.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Insert or replace. A file with the same name but different content
    /// replaces the older entry.
    pub fn insert(&self, file: SharedFile) {
        let mut files = self.write();
        files.retain(|_, f| f.record.name != file.record.name);
        files.insert(file.record.digest.clone(), file);
    }

    pub fn remove_by_name(&self, name: &str) -> Option<SharedFile> {
        let mut files = self.write();
        let digest = files
            .iter()
            .find(|(_, f)| f.record.name == name)
            .map(|(d, _)| d.clone())?;
        files.remove(&digest)
    }

    pub fn get(&self, digest: &str) -> Option<SharedFile> {
        self.read().get(digest).cloned()
    }

    /// Every entry, ordered by name.
    pub fn files(&self) -> Vec<SharedFile> {
        let mut out: Vec<_> = self.read().values().cloned().collect();
        out.sort_by(|a, b| a.record.name.cmp(&b.record.name));
        out
    }

    pub fn records(&self) -> Vec<FileRecord> {
        let mut out: Vec<_> = self.read().values().map(|f| f.record.clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Service gate ─────────────────────────────────────────────────────────────

/// The concurrent-service counter: at most `cap` chunk services at once.
#[derive(Debug, Clone)]
pub struct ServiceGate {
    permits: Arc<Semaphore>,
    cap: u32,
}

impl ServiceGate {
    pub fn new(cap: u32) -> Self {
        let cap = cap.max(1);
        Self {
            permits: Arc::new(Semaphore::new(cap as usize)),
            cap,
        }
    }

    /// Take a slot without waiting. `None` means the peer is at capacity.
    pub fn try_admit(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.permits).try_acquire_owned().ok()
    }

    /// Services currently in progress, in `[0, cap]`.
    pub fn load(&self) -> u32 {
        self.cap - self.permits.available_permits() as u32
    }
}

// ── Peer service ─────────────────────────────────────────────────────────────

pub struct PeerService {
    name: String,
    shares: Arc<ShareTable>,
    gate: ServiceGate,
    pool: WorkerPool,
}

impl PeerService {
    pub fn new(name: impl Into<String>, shares: Arc<ShareTable>, gate: ServiceGate, pool: WorkerPool) -> Self {
        Self {
            name: name.into(),
            shares,
            gate,
            pool,
        }
    }

    pub fn gate(&self) -> &ServiceGate {
        &self.gate
    }

    /// The shared file behind `digest`, if `remote` may see it. A file the
    /// caller is not allowed to see is reported exactly like an unknown one.
    fn resolve(&self, digest: &str, remote: IpAddr) -> Option<SharedFile> {
        let file = self.shares.get(digest)?;
        if !file.record.access.allows_addr(remote) {
            debug!(event = "access_denied", digest = %digest, %remote, "Restricted file requested by a peer not on its list");
            return None;
        }
        Some(file)
    }

    async fn serve_chunk(&self, digest: String, index: u32, remote: IpAddr) -> Reply {
        let Some(file) = self.resolve(&digest, remote) else {
            return Response::NotFound(format!("not sharing {digest}")).into();
        };
        if index >= chunk_count(file.record.size) {
            return Response::NotFound(format!("chunk {index} out of range")).into();
        }
        let Some(permit) = self.gate.try_admit() else {
            debug!(event = "chunk_busy", digest = %digest, index, load = self.gate.load(), "At service cap");
            return Response::Busy.into();
        };

        let path = file.path.clone();
        let read = self
            .pool
            .run(move || read_chunk(&path, index).map(|data| (digest_chunk(&data), data)))
            .await;

        let response = match read {
            Ok(Ok((checksum, data))) => Response::Chunk {
                digest,
                index,
                checksum,
                data,
            },
            Ok(Err(e)) => {
                warn!(event = "chunk_read_failure", digest = %digest, index, error = %e, "Failed to read chunk");
                Response::Error(format!("read chunk {index}: {e}"))
            }
            Err(e) => Response::Error(e.to_string()),
        };
        Reply {
            response,
            hold: Some(permit),
        }
    }

    fn manifest(&self, digest: &str, remote: IpAddr) -> Response {
        match self.resolve(digest, remote) {
            Some(file) => Response::FileInfo(FileManifest {
                name: file.record.name,
                size: file.record.size,
                digest: file.record.digest,
                chunk_count: file.chunk_digests.len() as u32,
                chunk_digests: file.chunk_digests,
                load: self.gate.load(),
            }),
            None => Response::NotFound(format!("not sharing {digest}")),
        }
    }

    /// Listing as seen from `remote`.
    fn listing_for(&self, remote: IpAddr) -> Vec<FileRecord> {
        self.shares
            .records()
            .into_iter()
            .filter(|r| r.access.allows_addr(remote))
            .collect()
    }
}

impl RequestHandler for PeerService {
    async fn handle(&self, ctx: &ConnCtx, request: Request) -> Reply {
        match request {
            Request::GetChunk { digest, index } => self.serve_chunk(digest, index, ctx.remote.ip()).await,
            Request::FileInfo { digest } => self.manifest(&digest, ctx.remote.ip()).into(),
            Request::SharedList => Response::SharedList(self.listing_for(ctx.remote.ip())).into(),
            Request::Ping => Response::Pong {
                name: self.name.clone(),
                load: self.gate.load(),
            }
            .into(),
            other => Response::Error(format!("{} is not served by peers", other.kind())).into(),
        }
    }
}
