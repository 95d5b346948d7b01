//! PeerNode: the peer process core.
//!
//! Composes identity enrollment, the serving reactor, the share table, the
//! task registry and the download manager, and exposes the operations a
//! front-end calls. Long-running work (hashing a share, downloading) runs in
//! the background and reports through task state; the calls themselves only
//! return a task id or an immediate status.

use crate::core::config::{CONNECT_RETRY_DELAYS, PEER_SERVER_NAME, TRACKER_SERVER_NAME};
use crate::core::connection::client::Connector;
use crate::core::connection::pool::WorkerPool;
use crate::core::connection::reactor::Reactor;
use crate::core::discovery::{self, TrackerLocation};
use crate::core::download::{ControlError, DownloadConfig, DownloadManager};
use crate::core::engine::{PeerService, ServiceGate, ShareTable, SharedFile};
use crate::core::error::TransferError;
use crate::core::persistence::ShareCatalog;
use crate::core::pipeline::digest::digest_file;
use crate::core::protocol::message::{AccessPolicy, FileRecord, PeerIdentity, Request, Response};
use crate::core::security::identity::IdentityManager;
use crate::core::transaction::{NewTask, TaskKind, TaskManager, TaskState, TransferTask};
use crate::utils::sos::SignalOfStop;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub name: String,
    /// Interface the peer service binds to.
    pub bind_host: String,
    /// Host announced to the tracker. A wildcard lets the tracker use the
    /// connection's source address.
    pub advertise_host: String,
    pub port: u16,
    /// Tracker endpoints; discovered on the LAN when absent.
    pub tracker: Option<TrackerLocation>,
    pub discovery_port: u16,
    pub certs_dir: PathBuf,
    pub download_dir: PathBuf,
    /// Share list kept across restarts.
    pub shares_file: PathBuf,
    pub anchor_fingerprint: Option<String>,
    pub service_cap: u32,
    pub download: DownloadConfig,
}

pub struct PeerNode {
    me: PeerIdentity,
    tracker: TrackerLocation,
    tracker_conn: Connector,
    retry_delays: Vec<Duration>,
    shares: Arc<ShareTable>,
    gate: ServiceGate,
    pool: WorkerPool,
    tasks: Arc<TaskManager>,
    downloads: Arc<DownloadManager>,
    download_dir: PathBuf,
    shares_file: PathBuf,
    stall_timeout: Duration,
    visible: Mutex<Vec<FileRecord>>,
    share_jobs: Mutex<HashMap<u64, SignalOfStop>>,
    services: Mutex<Vec<JoinHandle<()>>>,
    sos: SignalOfStop,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Map a tracker or peer reply that is not the expected variant.
fn unexpected(response: Response) -> TransferError {
    match response {
        Response::NotFound(m) => TransferError::NotFound(m),
        Response::Error(m) => TransferError::Protocol(m),
        Response::Busy => TransferError::Busy,
        other => TransferError::Protocol(format!("unexpected {} reply", other.kind())),
    }
}

impl PeerNode {
    /// Locate the tracker, make sure a certificate exists, start serving,
    /// and rebuild resumable downloads left from a previous run.
    pub async fn start(config: PeerConfig, pool: WorkerPool, sos: SignalOfStop) -> Result<Arc<Self>> {
        let tracker = match config.tracker {
            Some(t) => t,
            None => discovery::discover(config.discovery_port)
                .await?
                .context("no tracker configured and none answered on the LAN")?,
        };

        let identity = IdentityManager::new(&config.certs_dir, config.anchor_fingerprint.clone(), pool.clone());
        let trust = identity.ensure_identity(&tracker.enroll.to_string()).await?;

        let listener = TcpListener::bind((config.bind_host.as_str(), config.port))
            .await
            .with_context(|| format!("bind peer service on {}:{}", config.bind_host, config.port))?;
        let port = listener.local_addr()?.port();
        let me = PeerIdentity::new(config.advertise_host.clone(), port, config.name.clone());

        let sos = sos.child();
        let shares = Arc::new(ShareTable::new());
        let shares_file = config.shares_file.clone();
        let catalog = pool
            .run(move || {
                let mut catalog = ShareCatalog::load(&shares_file)?;
                catalog.retain_present();
                anyhow::Ok(catalog)
            })
            .await??;
        for mut file in catalog.files {
            file.record.owner = me.clone();
            shares.insert(file);
        }
        let gate = ServiceGate::new(config.service_cap);
        let service = PeerService::new(config.name.clone(), Arc::clone(&shares), gate.clone(), pool.clone());
        let reactor = Reactor::new("peer", Arc::clone(&trust.server), Arc::new(service));
        let mut services = vec![tokio::spawn(reactor.serve(listener, sos.clone()))];

        let tasks = Arc::new(TaskManager::new());
        let downloads = DownloadManager::new(
            Arc::clone(&tasks),
            Connector::new(Arc::clone(&trust.client), PEER_SERVER_NAME)?,
            pool.clone(),
            config.download.clone(),
            sos.clone(),
        );
        services.push(tokio::spawn(Arc::clone(&downloads).monitor(sos.clone())));

        std::fs::create_dir_all(&config.download_dir)
            .with_context(|| format!("create {}", config.download_dir.display()))?;
        let restored = downloads.restore(&config.download_dir);

        info!(
            event = "peer_started",
            peer = %me,
            cn = %trust.common_name,
            tracker = %tracker.registry,
            restored = restored.len(),
            shared = shares.len(),
            "Peer started"
        );

        Ok(Arc::new(Self {
            me,
            tracker,
            tracker_conn: Connector::new(Arc::clone(&trust.client), TRACKER_SERVER_NAME)?,
            retry_delays: CONNECT_RETRY_DELAYS.to_vec(),
            shares,
            gate,
            pool,
            tasks,
            downloads,
            download_dir: config.download_dir,
            shares_file: config.shares_file,
            stall_timeout: config.download.stall_timeout,
            visible: Mutex::new(Vec::new()),
            share_jobs: Mutex::new(HashMap::new()),
            services: Mutex::new(services),
            sos,
        }))
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.me
    }

    pub fn tracker(&self) -> TrackerLocation {
        self.tracker
    }

    /// Current chunk services in progress.
    pub fn load(&self) -> u32 {
        self.gate.load()
    }

    /// Issue a tracker request, retrying connectivity failures with backoff.
    async fn tracker_request(&self, request: Request) -> Result<Response, TransferError> {
        let addr = self.tracker.registry.to_string();
        let mut delays = self.retry_delays.iter();
        loop {
            match self.tracker_conn.request(&addr, &request).await {
                Err(TransferError::Connectivity(reason)) => {
                    let Some(delay) = delays.next() else {
                        return Err(TransferError::Connectivity(reason));
                    };
                    warn!(
                        event = "tracker_retry",
                        request = request.kind(),
                        error = %reason,
                        retry_in_ms = delay.as_millis() as u64,
                        "Tracker unreachable"
                    );
                    tokio::select! {
                        _ = self.sos.wait() => return Err(TransferError::Cancelled),
                        _ = tokio::time::sleep(*delay) => {}
                    }
                }
                other => return other,
            }
        }
    }

    fn remember_visible(&self, visible: Vec<FileRecord>) -> Vec<FileRecord> {
        *lock(&self.visible) = visible.clone();
        visible
    }

    // ── Tracker operations ───────────────────────────────────────────────────

    /// Announce this peer and everything it shares. Returns the files other
    /// peers make visible to it.
    pub async fn register(&self) -> Result<Vec<FileRecord>, TransferError> {
        let request = Request::Register {
            peer: self.me.clone(),
            files: self.shares.records(),
        };
        match self.tracker_request(request).await? {
            Response::Registered { visible } => {
                info!(event = "registered", visible = visible.len(), "Registered with tracker");
                Ok(self.remember_visible(visible))
            }
            other => Err(unexpected(other)),
        }
    }

    pub async fn refresh(&self) -> Result<Vec<FileRecord>, TransferError> {
        match self.tracker_request(Request::Refresh { peer: self.me.clone() }).await? {
            Response::Refreshed { visible } => Ok(self.remember_visible(visible)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn search(&self, keyword: &str) -> Result<Vec<FileRecord>, TransferError> {
        let request = Request::Search {
            requester: self.me.clone(),
            keyword: keyword.to_string(),
        };
        match self.tracker_request(request).await? {
            Response::SearchResults(found) => Ok(found),
            other => Err(unexpected(other)),
        }
    }

    pub async fn known_peers(&self) -> Result<Vec<PeerIdentity>, TransferError> {
        match self.tracker_request(Request::KnownPeers { requester: self.me.clone() }).await? {
            Response::KnownPeers(peers) => Ok(peers),
            other => Err(unexpected(other)),
        }
    }

    /// Peers currently holding `digest`, excluding this one.
    pub async fn holders(&self, digest: &str) -> Result<Vec<PeerIdentity>, TransferError> {
        let request = Request::Query {
            requester: self.me.clone(),
            digest: digest.to_string(),
        };
        match self.tracker_request(request).await? {
            Response::Holders(peers) => Ok(peers),
            other => Err(unexpected(other)),
        }
    }

    /// Files other peers share with this one, as of the last register or
    /// refresh.
    pub fn visible_files(&self) -> Vec<FileRecord> {
        lock(&self.visible).clone()
    }

    pub fn shared_files(&self) -> Vec<FileRecord> {
        self.shares.records()
    }

    // ── Sharing ──────────────────────────────────────────────────────────────

    /// Share the file at `path`. Hashing runs as a Share task whose progress
    /// is the hashing progress; the file is served and announced once the
    /// task completes.
    pub fn share_file(self: &Arc<Self>, path: &Path, access: AccessPolicy) -> Result<u64, TransferError> {
        let meta = std::fs::metadata(path)
            .map_err(|e| TransferError::Resource(format!("{}: {e}", path.display())))?;
        if !meta.is_file() {
            return Err(TransferError::Resource(format!("{} is not a file", path.display())));
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransferError::Resource(format!("{} has no usable name", path.display())))?
            .to_string();
        let size = meta.len();

        let id = self.tasks.create(NewTask::new(
            TaskKind::Share,
            name.clone(),
            String::new(),
            size,
            path.to_path_buf(),
            self.stall_timeout,
        ));
        let job = self.sos.child();
        lock(&self.share_jobs).insert(id, job.clone());

        let this = Arc::clone(self);
        let path = path.to_path_buf();
        tokio::spawn(async move {
            this.run_share(id, name, path, size, access, job).await;
            lock(&this.share_jobs).remove(&id);
        });
        Ok(id)
    }

    async fn run_share(&self, id: u64, name: String, path: PathBuf, size: u64, access: AccessPolicy, job: SignalOfStop) {
        if self.tasks.transition(id, TaskState::Sharing).is_err() {
            return;
        }
        info!(event = "share_started", task_id = id, name = %name, "Hashing file for sharing");

        let tasks = Arc::clone(&self.tasks);
        let hash_path = path.clone();
        let hashed = self
            .pool
            .run(move || {
                digest_file(&hash_path, &job, |pct| {
                    let _ = tasks.update(id, |t| {
                        if t.state == TaskState::Timeout {
                            let _ = t.transition(TaskState::Sharing);
                        }
                        t.advance_to(size * pct as u64 / 100);
                    });
                })
            })
            .await;

        let digest = match hashed {
            Ok(Ok(Some(d))) => d,
            Ok(Ok(None)) => {
                debug!(event = "share_cancelled", task_id = id, "Hashing cancelled");
                return;
            }
            Ok(Err(e)) => return self.fail_task(id, format!("hash {}: {e}", path.display())),
            Err(e) => return self.fail_task(id, e.to_string()),
        };

        let record = FileRecord {
            name: name.clone(),
            size: digest.size,
            digest: digest.digest.clone(),
            owner: self.me.clone(),
            shared_by_me: true,
            access,
        };
        let _ = self.tasks.update(id, |t| {
            if t.state == TaskState::Timeout {
                let _ = t.transition(TaskState::Sharing);
            }
            t.digest = record.digest.clone();
            t.total_bytes = record.size;
            t.advance_to(record.size);
        });
        if self.tasks.state(id).is_some_and(|s| s.is_terminal()) {
            return;
        }
        self.shares.insert(SharedFile {
            record: record.clone(),
            path,
            chunk_digests: digest.chunk_digests,
        });
        self.persist_shares().await;

        let announce = Request::Share {
            peer: self.me.clone(),
            file: record,
        };
        match self.tracker_request(announce).await {
            Ok(Response::Ack) => {}
            Ok(other) => warn!(event = "share_announce_failure", task_id = id, error = %unexpected(other), "Tracker did not accept share"),
            Err(e) => warn!(event = "share_announce_failure", task_id = id, error = %e, "Tracker did not accept share"),
        }

        if self.tasks.transition(id, TaskState::Completed).is_ok() {
            info!(event = "share_completed", task_id = id, name = %name, "File shared");
        }
    }

    /// Rewrite the share catalog. A failed write is logged: the share itself
    /// stays live for this run.
    async fn persist_shares(&self) {
        let mut catalog = ShareCatalog::new(self.shares.files());
        let path = self.shares_file.clone();
        match self.pool.run(move || catalog.save(&path)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(event = "share_catalog_write_failure", error = %e, "Could not save share list"),
            Err(e) => warn!(event = "share_catalog_write_failure", error = %e, "Could not save share list"),
        }
    }

    fn fail_task(&self, id: u64, reason: String) {
        warn!(event = "task_failed", task_id = id, reason = %reason, "Task failed");
        let _ = self.tasks.update(id, |t| t.fail(reason));
    }

    /// Stop sharing `name`. Returns whether it was shared.
    pub async fn unshare(&self, name: &str) -> Result<bool, TransferError> {
        if self.shares.remove_by_name(name).is_none() {
            return Ok(false);
        }
        self.persist_shares().await;
        let request = Request::Unshare {
            peer: self.me.clone(),
            name: name.to_string(),
        };
        match self.tracker_request(request).await? {
            Response::Ack | Response::NotFound(_) => Ok(true),
            other => Err(unexpected(other)),
        }
    }

    // ── Downloads ────────────────────────────────────────────────────────────

    /// Download `file` from whichever peers currently hold it. Saves under
    /// the download directory unless `save_path` is given.
    pub async fn download(self: &Arc<Self>, file: FileRecord, save_path: Option<PathBuf>) -> Result<u64, TransferError> {
        let sources = self.holders(&file.digest).await?;
        let save_path = save_path.unwrap_or_else(|| self.download_dir.join(&file.name));
        self.downloads.start_download(file, sources, save_path)
    }

    // ── Tasks ────────────────────────────────────────────────────────────────

    pub fn task(&self, id: u64) -> Option<TransferTask> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> Vec<TransferTask> {
        self.tasks.list()
    }

    pub fn pause_task(&self, id: u64) -> Result<(), ControlError> {
        self.downloads.pause_task(id)
    }

    /// Resume a download, adding whoever holds the file now to the sources
    /// remembered from before.
    pub async fn resume_task(&self, id: u64) -> Result<(), ControlError> {
        let digest = self.tasks.get(id).ok_or(ControlError::UnknownTask(id))?.digest;
        let sources = match self.holders(&digest).await {
            Ok(peers) => peers,
            Err(e) => {
                debug!(event = "resume_holders_unavailable", task_id = id, error = %e, "Resuming with remembered sources");
                Vec::new()
            }
        };
        self.downloads.resume_task(id, sources).await
    }

    pub fn cancel_task(&self, id: u64) -> Result<(), ControlError> {
        self.downloads.cancel_task(id)?;
        if let Some(job) = lock(&self.share_jobs).remove(&id) {
            job.cancel();
        }
        Ok(())
    }

    pub async fn cleanup_tasks(&self, ids: &[u64]) -> Vec<u64> {
        self.downloads.cleanup_tasks(ids).await
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Leave the tracker, stop serving and persist running downloads.
    pub async fn stop(&self) {
        let bye = Request::Unregister { peer: self.me.clone() };
        if let Err(e) = self.tracker_conn.request(&self.tracker.registry.to_string(), &bye).await {
            debug!(event = "unregister_failure", error = %e, "Could not unregister");
        }
        self.sos.cancel();
        self.downloads.shutdown().await;
        let services: Vec<_> = lock(&self.services).drain(..).collect();
        for handle in services {
            let _ = handle.await;
        }
        info!(event = "peer_stopped", peer = %self.me, "Peer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CHUNK_SIZE;
    use crate::core::tracker::{Tracker, TrackerConfig};

    async fn start_tracker(root: &Path, pool: &WorkerPool, sos: &SignalOfStop) -> Tracker {
        let config = TrackerConfig::new("127.0.0.1", 0, 0, root.join("tracker/ca"), 365);
        Tracker::start(config, pool.clone(), sos.clone()).await.unwrap()
    }

    async fn start_peer(name: &str, root: &Path, tracker: &Tracker, pool: &WorkerPool, sos: &SignalOfStop) -> Arc<PeerNode> {
        let base = root.join(name);
        let certs = base.join("certs");
        std::fs::create_dir_all(&certs).unwrap();
        std::fs::write(certs.join("root-ca.pem"), tracker.ca.root_pem()).unwrap();
        let config = PeerConfig {
            name: name.into(),
            bind_host: "127.0.0.1".into(),
            advertise_host: "127.0.0.1".into(),
            port: 0,
            tracker: Some(TrackerLocation {
                registry: tracker.registry_addr,
                enroll: tracker.enroll_addr,
            }),
            discovery_port: 0,
            certs_dir: certs,
            download_dir: base.join("downloads"),
            shares_file: base.join("shares.json"),
            anchor_fingerprint: None,
            service_cap: 3,
            download: DownloadConfig::default(),
        };
        PeerNode::start(config, pool.clone(), sos.clone()).await.unwrap()
    }

    async fn wait_for(node: &PeerNode, id: u64, want: TaskState) -> TransferTask {
        for _ in 0..600 {
            if let Some(task) = node.task(id)
                && task.state == want
            {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("task {id} never reached {want}: {:?}", node.task(id));
    }

    #[tokio::test]
    async fn test_share_search_and_download_between_peers() {
        let root = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(8);
        let sos = SignalOfStop::new();
        let tracker = start_tracker(root.path(), &pool, &sos).await;
        let alice = start_peer("alice", root.path(), &tracker, &pool, &sos).await;
        let bob = start_peer("bob", root.path(), &tracker, &pool, &sos).await;
        alice.register().await.unwrap();
        bob.register().await.unwrap();

        let data: Vec<u8> = (0..CHUNK_SIZE + 4096).map(|i| (i % 253) as u8).collect();
        let source = root.path().join("Holiday Photos.zip");
        std::fs::write(&source, &data).unwrap();
        let share = alice.share_file(&source, AccessPolicy::Public).unwrap();
        let task = wait_for(&alice, share, TaskState::Completed).await;
        assert_eq!(task.kind, TaskKind::Share);
        assert_eq!(task.bytes_transferred, data.len() as u64);
        assert_eq!(alice.shared_files().len(), 1);

        let secret = root.path().join("holiday-secret.txt");
        std::fs::write(&secret, b"for carol only").unwrap();
        let carol = PeerIdentity::new("10.9.9.9", 5000, "carol");
        let id = alice.share_file(&secret, AccessPolicy::Restricted(vec![carol])).unwrap();
        wait_for(&alice, id, TaskState::Completed).await;

        let found = bob.search("HOLIDAY").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].owner, *alice.identity());
        assert!(alice.search("holiday").await.unwrap().is_empty());

        let visible = bob.refresh().await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(bob.known_peers().await.unwrap(), vec![alice.identity().clone()]);

        let download = bob.download(found[0].clone(), None).await.unwrap();
        let task = wait_for(&bob, download, TaskState::Completed).await;
        assert_eq!(std::fs::read(&task.path).unwrap(), data);
        assert_eq!(bob.cleanup_tasks(&[download]).await, vec![download]);
        assert!(task.path.exists());

        assert!(alice.unshare("Holiday Photos.zip").await.unwrap());
        assert!(!alice.unshare("Holiday Photos.zip").await.unwrap());
        assert!(bob.search("photos").await.unwrap().is_empty());

        bob.stop().await;
        alice.stop().await;
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_shares_survive_restart() {
        let root = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(8);
        let sos = SignalOfStop::new();
        let tracker = start_tracker(root.path(), &pool, &sos).await;

        let source = root.path().join("report.pdf");
        std::fs::write(&source, b"quarterly numbers").unwrap();
        let friend = PeerIdentity::new("10.9.9.9", 5000, "friend");
        let alice = start_peer("alice", root.path(), &tracker, &pool, &sos).await;
        let id = alice
            .share_file(&source, AccessPolicy::Restricted(vec![friend.clone()]))
            .unwrap();
        wait_for(&alice, id, TaskState::Completed).await;
        alice.stop().await;

        let alice = start_peer("alice", root.path(), &tracker, &pool, &sos).await;
        let shared = alice.shared_files();
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].name, "report.pdf");
        assert_eq!(shared[0].access, AccessPolicy::Restricted(vec![friend]));
        assert_eq!(shared[0].owner, *alice.identity());
        alice.register().await.unwrap();

        // Unshared files stay gone after a restart.
        assert!(alice.unshare("report.pdf").await.unwrap());
        alice.stop().await;
        let alice = start_peer("alice", root.path(), &tracker, &pool, &sos).await;
        assert!(alice.shared_files().is_empty());

        alice.stop().await;
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_share_rejects_missing_file() {
        let root = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(4);
        let sos = SignalOfStop::new();
        let tracker = start_tracker(root.path(), &pool, &sos).await;
        let alice = start_peer("alice", root.path(), &tracker, &pool, &sos).await;

        let err = alice
            .share_file(&root.path().join("missing.bin"), AccessPolicy::Public)
            .unwrap_err();
        assert!(matches!(err, TransferError::Resource(_)));
        assert!(alice.tasks().is_empty());

        let err = alice.share_file(root.path(), AccessPolicy::Public).unwrap_err();
        assert!(matches!(err, TransferError::Resource(_)));

        alice.stop().await;
        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_download_of_unheld_file_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(4);
        let sos = SignalOfStop::new();
        let tracker = start_tracker(root.path(), &pool, &sos).await;
        let bob = start_peer("bob", root.path(), &tracker, &pool, &sos).await;
        bob.register().await.unwrap();

        let record = FileRecord {
            name: "ghost.bin".into(),
            size: 10,
            digest: "ff".repeat(32),
            owner: PeerIdentity::new("127.0.0.1", 9, "nobody"),
            shared_by_me: false,
            access: AccessPolicy::Public,
        };
        let err = bob.download(record, None).await.unwrap_err();
        assert!(matches!(err, TransferError::NotFound(_)));
        assert!(bob.tasks().is_empty());

        bob.stop().await;
        tracker.stop().await;
    }
}
