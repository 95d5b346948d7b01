//! Resumable multi-source download manager.
//!
//! A download runs as one tokio task (the runner) per transfer:
//!
//! 1. ask every known source for the file manifest (`FILE_INFO`), keeping
//!    each source's reported service load
//! 2. open the `.part` file and persist `.part.meta`
//! 3. fetch missing chunks concurrently, at most `max_parallel` in flight,
//!    each from the least-loaded eligible source
//! 4. verify every chunk against the manifest, write it at its offset,
//!    record it in the metadata and the task
//! 5. verify the whole-file digest and rename into place
//!
//! Control (pause, cancel, stall) arrives on a `watch` channel and is
//! observed between chunks. Chunks already fetched when a pause lands are
//! still written; a cancel drops in-flight fetches, which never touch disk.

use crate::core::config::{BUSY_BACKOFF, CANCEL_GRACE, CHUNK_SIZE, MAX_CHUNK_RETRIES, MAX_PARALLEL_CHUNKS, MONITOR_INTERVAL, STALL_TIMEOUT};
use crate::core::connection::client::Connector;
use crate::core::connection::pool::WorkerPool;
use crate::core::error::TransferError;
use crate::core::persistence::ResumeMetadata;
use crate::core::pipeline::chunk::{chunk_count, missing_chunks, verify_chunk};
use crate::core::pipeline::writer::{PartFile, remove_artifacts};
use crate::core::protocol::message::{FileManifest, FileRecord, PeerIdentity, Request, Response};
use crate::core::transaction::{NewTask, TaskKind, TaskManager, TaskState};
use crate::utils::sos::SignalOfStop;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Tunables for the download manager.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub max_parallel: usize,
    pub max_retries: u32,
    pub stall_timeout: Duration,
    pub cancel_grace: Duration,
    pub busy_backoff: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_parallel: MAX_PARALLEL_CHUNKS,
            max_retries: MAX_CHUNK_RETRIES,
            stall_timeout: STALL_TIMEOUT,
            cancel_grace: CANCEL_GRACE,
            busy_backoff: BUSY_BACKOFF,
        }
    }
}

/// Why a control request was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("no task with id {0}")]
    UnknownTask(u64),
    #[error("task {id} is {state}")]
    InvalidState { id: u64, state: TaskState },
    #[error("task {0} has no verified chunks to resume from")]
    NoResumeState(u64),
    #[error("task {0} is not a download")]
    NotADownload(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Directive {
    Run,
    Pause,
    Cancel,
    Stall,
    Shutdown,
}

struct Control {
    directive: watch::Sender<Directive>,
    handle: JoinHandle<()>,
}

/// How the runner loop ended.
enum Outcome {
    Complete,
    Stopped(Directive),
    Failed(String),
}

struct Source {
    peer: PeerIdentity,
    load: u32,
    in_flight: u32,
    dead: bool,
    busy_until: Option<Instant>,
}

pub struct DownloadManager {
    tasks: Arc<TaskManager>,
    connector: Connector,
    pool: WorkerPool,
    config: DownloadConfig,
    controls: Mutex<HashMap<u64, Control>>,
    sos: SignalOfStop,
}

impl DownloadManager {
    pub fn new(
        tasks: Arc<TaskManager>,
        connector: Connector,
        pool: WorkerPool,
        config: DownloadConfig,
        sos: SignalOfStop,
    ) -> Arc<Self> {
        Arc::new(Self {
            tasks,
            connector,
            pool,
            config,
            controls: Mutex::new(HashMap::new()),
            sos,
        })
    }

    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    fn lock_controls(&self) -> MutexGuard<'_, HashMap<u64, Control>> {
        match self.controls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ── Operations ───────────────────────────────────────────────────────────

    /// Start downloading `file` from `sources` into `save_path`.
    ///
    /// Resource problems (no sources, missing or unwritable destination
    /// directory, target already present or already being downloaded) are
    /// rejected before a task exists.
    pub fn start_download(
        self: &Arc<Self>,
        file: FileRecord,
        sources: Vec<PeerIdentity>,
        save_path: PathBuf,
    ) -> Result<u64, TransferError> {
        if sources.is_empty() {
            return Err(TransferError::NotFound(format!("no sources hold {}", file.name)));
        }
        self.check_destination(&save_path)?;

        let id = self.tasks.create(NewTask::new(
            TaskKind::Download,
            file.name.clone(),
            file.digest.clone(),
            file.size,
            save_path.clone(),
            self.config.stall_timeout,
        ));
        info!(
            event = "download_started",
            task_id = id,
            name = %file.name,
            digest = %file.digest,
            sources = sources.len(),
            "Download started"
        );
        self.spawn_runner(id, Plan::Fresh { file, sources, save_path });
        Ok(id)
    }

    /// Suspend a running download. The task is `Paused` at once; chunks
    /// already in flight are still written and recorded.
    pub fn pause_task(&self, id: u64) -> Result<(), ControlError> {
        let task = self.tasks.get(id).ok_or(ControlError::UnknownTask(id))?;
        if task.kind != TaskKind::Download {
            return Err(ControlError::NotADownload(id));
        }
        if task.state != TaskState::Downloading {
            return Err(ControlError::InvalidState { id, state: task.state });
        }
        self.tasks
            .transition(id, TaskState::Paused)
            .map_err(|_| ControlError::InvalidState { id, state: task.state })?;
        self.signal(id, Directive::Pause);
        info!(event = "download_paused", task_id = id, "Download paused");
        Ok(())
    }

    /// Continue a `Paused`, `Timeout` or `Resumable` download from its
    /// persisted metadata. Refused when no chunk was ever verified.
    /// `sources` are merged with the ones remembered in the metadata.
    pub async fn resume_task(self: &Arc<Self>, id: u64, sources: Vec<PeerIdentity>) -> Result<(), ControlError> {
        let task = self.tasks.get(id).ok_or(ControlError::UnknownTask(id))?;
        if task.kind != TaskKind::Download {
            return Err(ControlError::NotADownload(id));
        }
        if !task.state.is_resumable() {
            return Err(ControlError::InvalidState { id, state: task.state });
        }

        // Let a runner that is still draining finish before reading its
        // metadata. Only a runner of a task that is still resumable is
        // stale; once a concurrent resume has claimed the task its runner
        // is left alone.
        let previous = {
            let mut controls = self.lock_controls();
            match self.tasks.state(id) {
                Some(state) if state.is_resumable() => controls.remove(&id),
                Some(state) => return Err(ControlError::InvalidState { id, state }),
                None => return Err(ControlError::UnknownTask(id)),
            }
        };
        if let Some(control) = previous {
            let _ = control.handle.await;
        }

        let path = task.path.clone();
        let mut meta = match self.pool.run(move || ResumeMetadata::load(&path)).await {
            Ok(Ok(Some(meta))) if meta.has_progress() => meta,
            Ok(Err(e)) => {
                warn!(event = "resume_metadata_unreadable", task_id = id, error = %e, "Cannot resume");
                return Err(ControlError::NoResumeState(id));
            }
            _ => return Err(ControlError::NoResumeState(id)),
        };
        for peer in sources {
            if !meta.sources.contains(&peer) {
                meta.sources.push(peer);
            }
        }

        // Claim the task and register its runner in one step, so a second
        // resume either sees `Downloading` or never got this far.
        let mut controls = self.lock_controls();
        let claimed = self.tasks.update(id, |t| {
            if !t.state.is_resumable() {
                return Err(t.state);
            }
            t.transition(TaskState::Downloading).map_err(|_| t.state)
        });
        match claimed {
            Ok(Ok(())) => {}
            Ok(Err(state)) => return Err(ControlError::InvalidState { id, state }),
            Err(_) => return Err(ControlError::UnknownTask(id)),
        }
        info!(
            event = "download_resumed",
            task_id = id,
            verified = meta.verified_chunks.len(),
            from = %task.state,
            "Download resumed"
        );
        self.spawn_runner_locked(&mut controls, id, Plan::Resume { meta });
        Ok(())
    }

    /// Cancel any non-terminal task. The state flips immediately; partial
    /// download artifacts are removed after the grace delay.
    pub fn cancel_task(self: &Arc<Self>, id: u64) -> Result<(), ControlError> {
        let task = self.tasks.get(id).ok_or(ControlError::UnknownTask(id))?;
        if task.state.is_terminal() {
            return Err(ControlError::InvalidState { id, state: task.state });
        }
        self.tasks
            .transition(id, TaskState::Cancelled)
            .map_err(|_| ControlError::InvalidState { id, state: task.state })?;
        self.signal(id, Directive::Cancel);
        info!(event = "task_cancelled", task_id = id, "Task cancelled");

        if task.kind == TaskKind::Download {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(this.config.cancel_grace).await;
                let runner = this.lock_controls().remove(&id);
                if let Some(control) = runner {
                    let _ = control.handle.await;
                }
                this.discard_artifacts(id, task.path).await;
            });
        }
        Ok(())
    }

    /// Forget terminal tasks, deleting any leftover partial files. Unknown
    /// or non-terminal ids are skipped. Returns the ids actually removed.
    pub async fn cleanup_tasks(&self, ids: &[u64]) -> Vec<u64> {
        let mut removed = Vec::new();
        for &id in ids {
            let Some(task) = self.tasks.remove_terminal(id) else {
                continue;
            };
            let runner = self.lock_controls().remove(&id);
            if let Some(control) = runner {
                let _ = control.handle.await;
            }
            if task.kind == TaskKind::Download {
                self.discard_artifacts(id, task.path).await;
            }
            removed.push(id);
        }
        removed
    }

    /// Rebuild `Resumable` tasks from metadata left under `dir`. Downloads
    /// already tracked by a live task are skipped.
    pub fn restore(&self, dir: &Path) -> Vec<u64> {
        let tracked: HashSet<PathBuf> = self
            .tasks
            .list()
            .into_iter()
            .filter(|t| t.kind == TaskKind::Download && !t.state.is_terminal())
            .map(|t| t.path)
            .collect();

        let mut ids = Vec::new();
        for meta in ResumeMetadata::scan(dir) {
            if tracked.contains(&meta.save_path) {
                continue;
            }
            let mut new_task = NewTask::new(
                TaskKind::Download,
                meta.name.clone(),
                meta.digest.clone(),
                meta.size,
                meta.save_path.clone(),
                self.config.stall_timeout,
            );
            new_task.state = TaskState::Resumable;
            new_task.bytes_transferred = meta.verified_bytes();
            new_task.verified_chunks = meta.verified_chunks.clone();
            let id = self.tasks.create(new_task);
            info!(
                event = "download_restored",
                task_id = id,
                name = %meta.name,
                verified = meta.verified_chunks.len(),
                "Restored resumable download"
            );
            ids.push(id);
        }
        ids
    }

    /// One monitor pass: flip stalled tasks to `Timeout` and stop their
    /// runners. Returns the affected ids.
    pub fn check_stalls(&self) -> Vec<u64> {
        let stalled = self.tasks.mark_stalled(Instant::now());
        for &id in &stalled {
            warn!(event = "task_stalled", task_id = id, "No progress within threshold");
            self.signal(id, Directive::Stall);
        }
        stalled
    }

    /// Periodic stall monitor. Runs until `sos` fires.
    pub async fn monitor(self: Arc<Self>, sos: SignalOfStop) {
        let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = sos.wait() => break,
                _ = ticker.tick() => {
                    self.check_stalls();
                }
            }
        }
    }

    /// Stop every runner and wait for them to persist their state.
    pub async fn shutdown(&self) {
        let controls: Vec<(u64, Control)> = self.lock_controls().drain().collect();
        for (id, control) in controls {
            let _ = control.directive.send(Directive::Shutdown);
            let _ = control.handle.await;
            debug!(event = "runner_stopped", task_id = id, "Runner stopped");
        }
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn check_destination(&self, save_path: &Path) -> Result<(), TransferError> {
        let parent = save_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let meta = std::fs::metadata(parent)
            .map_err(|e| TransferError::Resource(format!("destination {}: {e}", parent.display())))?;
        if !meta.is_dir() {
            return Err(TransferError::Resource(format!("{} is not a directory", parent.display())));
        }
        if meta.permissions().readonly() {
            return Err(TransferError::Resource(format!("{} is not writable", parent.display())));
        }
        if save_path.exists() {
            return Err(TransferError::Resource(format!("{} already exists", save_path.display())));
        }
        let busy = self.tasks.list().into_iter().any(|t| {
            t.kind == TaskKind::Download && !t.state.is_terminal() && t.path == save_path
        });
        if busy {
            return Err(TransferError::Resource(format!(
                "{} is already being downloaded",
                save_path.display()
            )));
        }
        Ok(())
    }

    fn signal(&self, id: u64, directive: Directive) {
        if let Some(control) = self.lock_controls().get(&id) {
            let _ = control.directive.send(directive);
        }
    }

    async fn discard_artifacts(&self, id: u64, save_path: PathBuf) {
        let target = save_path.clone();
        match self.pool.run(move || remove_artifacts(&target)).await {
            Ok(Ok(())) => debug!(event = "artifacts_removed", task_id = id, path = %save_path.display(), "Partial files removed"),
            Ok(Err(e)) => warn!(event = "artifact_removal_failure", task_id = id, error = %e, "Failed to remove partial files"),
            Err(e) => warn!(event = "artifact_removal_failure", task_id = id, error = %e, "Failed to remove partial files"),
        }
    }

    fn spawn_runner(self: &Arc<Self>, id: u64, plan: Plan) {
        let mut controls = self.lock_controls();
        self.spawn_runner_locked(&mut controls, id, plan);
    }

    fn spawn_runner_locked(self: &Arc<Self>, controls: &mut HashMap<u64, Control>, id: u64, plan: Plan) {
        let (tx, rx) = watch::channel(Directive::Run);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.run(id, plan, rx).await;
        });
        controls.insert(id, Control { directive: tx, handle });
    }

    async fn run(self: Arc<Self>, id: u64, plan: Plan, mut directive: watch::Receiver<Directive>) {
        let mut meta = match self.prepare(id, plan).await {
            Ok(meta) => meta,
            Err(e) => {
                warn!(event = "download_failed", task_id = id, error = %e, "Download failed");
                let _ = self.tasks.update(id, |t| t.fail(e.to_string()));
                return;
            }
        };

        let stop = *directive.borrow();
        if stop != Directive::Run {
            self.settle(id, &mut meta, Outcome::Stopped(stop)).await;
            return;
        }
        if self.tasks.transition(id, TaskState::Downloading).is_err() {
            // Cancelled or paused while the manifest was in flight.
            let state = self.tasks.state(id);
            debug!(event = "runner_superseded", task_id = id, state = ?state, "Task left the runnable states");
            return;
        }

        let outcome = self.fetch_all(id, &mut meta, &mut directive).await;
        self.settle(id, &mut meta, outcome).await;
    }

    /// Resolve the manifest and open the part file.
    async fn prepare(&self, id: u64, plan: Plan) -> Result<ResumeMetadata, TransferError> {
        let meta = match plan {
            Plan::Fresh { file, sources, save_path } => {
                let probes = self.probe(&file.digest, &sources).await;
                let (manifest, _) = probes
                    .into_iter()
                    .find(|(m, _)| m.size == file.size && m.chunk_count == chunk_count(m.size))
                    .ok_or_else(|| TransferError::NotFound(format!("no source could describe {}", file.name)))?;
                ResumeMetadata::new(
                    file.name,
                    manifest.digest,
                    manifest.size,
                    CHUNK_SIZE,
                    manifest.chunk_digests,
                    &save_path,
                    sources,
                )
            }
            Plan::Resume { meta } => meta,
        };

        if meta.chunk_size != CHUNK_SIZE || meta.chunk_digests.len() != chunk_count(meta.size) as usize {
            return Err(TransferError::Protocol(format!(
                "resume metadata for {} does not match the chunk layout",
                meta.name
            )));
        }

        let save = meta.save_path.clone();
        let size = meta.size;
        let mut snapshot = meta.clone();
        self.pool
            .run(move || -> std::io::Result<()> {
                PartFile::open(&save, size)?;
                snapshot.save().map_err(std::io::Error::other)
            })
            .await??;

        self.tasks
            .update(id, |t| {
                t.total_bytes = meta.size;
                t.touch();
            })
            .map_err(|e| TransferError::Resource(e.to_string()))?;
        Ok(meta)
    }

    /// Ask every source for the manifest. Sources that answer are returned
    /// least-loaded first.
    async fn probe(&self, digest: &str, sources: &[PeerIdentity]) -> Vec<(FileManifest, PeerIdentity)> {
        let mut set = JoinSet::new();
        for peer in sources {
            let connector = self.connector.clone();
            let peer = peer.clone();
            let request = Request::FileInfo {
                digest: digest.to_string(),
            };
            set.spawn(async move {
                let res = connector.request(&peer.addr(), &request).await;
                (peer, res)
            });
        }
        let mut found = Vec::new();
        while let Some(joined) = set.join_next().await {
            let Ok((peer, res)) = joined else { continue };
            match res {
                Ok(Response::FileInfo(m)) if m.digest == digest => found.push((m, peer)),
                Ok(other) => debug!(event = "probe_rejected", peer = %peer, response = other.kind(), "Source cannot serve"),
                Err(e) => debug!(event = "probe_failure", peer = %peer, error = %e, "Source unreachable"),
            }
        }
        found.sort_by_key(|(m, _)| m.load);
        found
    }

    async fn fetch_all(
        &self,
        id: u64,
        meta: &mut ResumeMetadata,
        directive: &mut watch::Receiver<Directive>,
    ) -> Outcome {
        let mut sources: Vec<Source> = self
            .probe(&meta.digest, &meta.sources)
            .await
            .into_iter()
            .map(|(m, peer)| Source {
                peer,
                load: m.load,
                in_flight: 0,
                dead: false,
                busy_until: None,
            })
            .collect();
        if sources.is_empty() {
            return Outcome::Failed("no reachable source holds the file".into());
        }

        let part = match PartFile::open(&meta.save_path, meta.size) {
            Ok(p) => Arc::new(p),
            Err(e) => return Outcome::Failed(format!("open part file: {e}")),
        };

        let total = chunk_count(meta.size);
        let mut pending: VecDeque<u32> = missing_chunks(total, &meta.verified_chunks).into();
        let mut attempts: HashMap<u32, u32> = HashMap::new();
        let mut tried: HashMap<u32, HashSet<usize>> = HashMap::new();
        let mut in_flight: JoinSet<(u32, usize, Result<Vec<u8>, TransferError>)> = JoinSet::new();

        debug!(event = "fetch_plan", task_id = id, missing = pending.len(), total, "Fetching missing chunks");

        loop {
            if self.sos.cancelled() && *directive.borrow() == Directive::Run {
                return Outcome::Stopped(Directive::Shutdown);
            }
            let current = *directive.borrow();
            if current == Directive::Cancel {
                in_flight.abort_all();
                return Outcome::Stopped(current);
            }
            let running = current == Directive::Run;

            // Launch.
            let mut waiting_on_busy = false;
            while running && in_flight.len() < self.config.max_parallel {
                let Some(&index) = pending.front() else { break };
                let now = Instant::now();
                let avoid = tried.get(&index);
                match pick_source(&sources, avoid, now) {
                    Pick::Source(s) => {
                        pending.pop_front();
                        sources[s].in_flight += 1;
                        let connector = self.connector.clone();
                        let addr = sources[s].peer.addr();
                        let digest = meta.digest.clone();
                        in_flight.spawn(async move {
                            let res = fetch_chunk(&connector, &addr, digest, index).await;
                            (index, s, res)
                        });
                    }
                    Pick::AllBusy => {
                        waiting_on_busy = true;
                        break;
                    }
                    Pick::NoneAlive => {
                        in_flight.abort_all();
                        return Outcome::Failed("every source failed".into());
                    }
                }
            }

            if in_flight.is_empty() {
                if !running {
                    return Outcome::Stopped(current);
                }
                if pending.is_empty() {
                    return Outcome::Complete;
                }
            }

            // Wait for a completion, a directive change, or a busy source to
            // become eligible again.
            let backoff = self.config.busy_backoff;
            let joined = tokio::select! {
                joined = in_flight.join_next(), if !in_flight.is_empty() => joined,
                changed = directive.changed() => {
                    if changed.is_err() {
                        in_flight.abort_all();
                        return Outcome::Stopped(Directive::Shutdown);
                    }
                    continue;
                }
                _ = self.sos.wait(), if running => continue,
                _ = tokio::time::sleep(backoff), if waiting_on_busy => continue,
            };
            let Some(Ok((index, s, result))) = joined else { continue };
            sources[s].in_flight = sources[s].in_flight.saturating_sub(1);

            let expected = meta.chunk_digests.get(index as usize).map(String::as_str);
            let result = result.and_then(|data| {
                if verify_chunk(&data, expected) {
                    Ok(data)
                } else {
                    Err(TransferError::Integrity { index })
                }
            });
            let data = match result {
                Ok(data) => data,
                Err(TransferError::Busy) => {
                    debug!(event = "source_busy", task_id = id, peer = %sources[s].peer, index, "Source at capacity");
                    sources[s].load += 1;
                    sources[s].busy_until = Some(Instant::now() + backoff);
                    pending.push_back(index);
                    continue;
                }
                Err(e) => {
                    if let Some(outcome) = self.retry(id, index, s, e, &mut sources, &mut attempts, &mut tried, &mut pending) {
                        in_flight.abort_all();
                        return outcome;
                    }
                    continue;
                }
            };

            sources[s].load = sources[s].load.saturating_sub(1);
            if let Err(e) = self.commit_chunk(id, meta, &part, index, data).await {
                in_flight.abort_all();
                return Outcome::Failed(format!("write chunk {index}: {e}"));
            }
        }
    }

    /// Count a failed attempt and requeue the chunk. Returns an outcome when
    /// the task cannot continue.
    #[allow(clippy::too_many_arguments)]
    fn retry(
        &self,
        id: u64,
        index: u32,
        s: usize,
        error: TransferError,
        sources: &mut [Source],
        attempts: &mut HashMap<u32, u32>,
        tried: &mut HashMap<u32, HashSet<usize>>,
        pending: &mut VecDeque<u32>,
    ) -> Option<Outcome> {
        warn!(
            event = "chunk_failure",
            task_id = id,
            index,
            peer = %sources[s].peer,
            error = %error,
            "Chunk fetch failed"
        );
        // A source that is unreachable, untrusted or lost the file is not
        // asked again during this run.
        if !error.is_retryable() || matches!(error, TransferError::Connectivity(_) | TransferError::NotFound(_)) {
            sources[s].dead = true;
        }
        let count = attempts.entry(index).or_insert(0);
        *count += 1;
        if *count > self.config.max_retries {
            return Some(Outcome::Failed(format!(
                "chunk {index} failed {} times, last error: {error}",
                *count
            )));
        }
        tried.entry(index).or_default().insert(s);
        pending.push_front(index);
        None
    }

    async fn commit_chunk(
        &self,
        id: u64,
        meta: &mut ResumeMetadata,
        part: &Arc<PartFile>,
        index: u32,
        data: Vec<u8>,
    ) -> Result<(), TransferError> {
        let len = data.len() as u64;
        meta.verified_chunks.insert(index);
        let part = Arc::clone(part);
        let mut snapshot = meta.clone();
        self.pool
            .run(move || -> std::io::Result<()> {
                part.write_chunk(index, &data)?;
                snapshot.save().map_err(std::io::Error::other)
            })
            .await??;

        match self.tasks.update(id, |t| t.record_chunk(index, len)) {
            Ok(true) => debug!(event = "chunk_verified", task_id = id, index, "Chunk written"),
            Ok(false) => debug!(event = "chunk_duplicate", task_id = id, index, "Chunk was already recorded"),
            Err(e) => warn!(event = "chunk_untracked", task_id = id, index, error = %e, "Chunk written for a task that is gone"),
        }
        Ok(())
    }

    async fn settle(&self, id: u64, meta: &mut ResumeMetadata, outcome: Outcome) {
        match outcome {
            Outcome::Complete => {
                let save = meta.save_path.clone();
                let digest = meta.digest.clone();
                let size = meta.size;
                let finished = self
                    .pool
                    .run(move || -> anyhow::Result<()> {
                        let part = PartFile::open(&save, size)?;
                        part.finalize(&save, &digest)?;
                        remove_artifacts(&save)?;
                        Ok(())
                    })
                    .await;
                match finished {
                    Ok(Ok(())) => match self.tasks.transition(id, TaskState::Completed) {
                        Ok(()) => {
                            info!(event = "download_completed", task_id = id, path = %meta.save_path.display(), "Download completed")
                        }
                        Err(e) => warn!(
                            event = "completion_not_recorded",
                            task_id = id,
                            path = %meta.save_path.display(),
                            error = %e,
                            "File finalized but the task could not be marked completed"
                        ),
                    },
                    Ok(Err(e)) => self.fail(id, format!("finalize: {e:#}")),
                    Err(e) => self.fail(id, format!("finalize: {e}")),
                }
            }
            Outcome::Stopped(Directive::Cancel) => {}
            Outcome::Stopped(directive) => {
                if directive == Directive::Shutdown
                    && let Err(e) = self.tasks.transition(id, TaskState::Paused)
                {
                    debug!(event = "shutdown_pause_skipped", task_id = id, error = %e, "Task left running states before shutdown");
                }
                let mut snapshot = meta.clone();
                match self.pool.run(move || snapshot.save()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(event = "resume_metadata_failure", task_id = id, error = %e, "Failed to persist resume state"),
                    Err(e) => warn!(event = "resume_metadata_failure", task_id = id, error = %e, "Failed to persist resume state"),
                }
                debug!(event = "runner_stopped", task_id = id, reason = ?directive, "Runner stopped");
            }
            Outcome::Failed(reason) => self.fail(id, reason),
        }
    }

    fn fail(&self, id: u64, reason: String) {
        warn!(event = "download_failed", task_id = id, reason = %reason, "Download failed");
        let _ = self.tasks.update(id, |t| t.fail(reason));
    }
}

enum Plan {
    Fresh {
        file: FileRecord,
        sources: Vec<PeerIdentity>,
        save_path: PathBuf,
    },
    Resume {
        meta: ResumeMetadata,
    },
}

enum Pick {
    Source(usize),
    AllBusy,
    NoneAlive,
}

/// Least-loaded live source, preferring ones not yet tried for this chunk.
fn pick_source(sources: &[Source], avoid: Option<&HashSet<usize>>, now: Instant) -> Pick {
    let alive: Vec<usize> = (0..sources.len()).filter(|&i| !sources[i].dead).collect();
    if alive.is_empty() {
        return Pick::NoneAlive;
    }
    let ready: Vec<usize> = alive
        .into_iter()
        .filter(|&i| sources[i].busy_until.is_none_or(|t| t <= now))
        .collect();
    let fresh: Vec<usize> = ready
        .iter()
        .copied()
        .filter(|i| avoid.is_none_or(|a| !a.contains(i)))
        .collect();
    let pool = if fresh.is_empty() { ready } else { fresh };
    pool.into_iter()
        .min_by_key(|&i| sources[i].load + sources[i].in_flight)
        .map_or(Pick::AllBusy, Pick::Source)
}

async fn fetch_chunk(connector: &Connector, addr: &str, digest: String, index: u32) -> Result<Vec<u8>, TransferError> {
    match connector.request(addr, &Request::GetChunk { digest, index }).await? {
        Response::Chunk {
            index: got,
            checksum,
            data,
            ..
        } if got == index => {
            if verify_chunk(&data, Some(&checksum)) {
                Ok(data)
            } else {
                Err(TransferError::Integrity { index })
            }
        }
        Response::Busy => Err(TransferError::Busy),
        Response::NotFound(m) => Err(TransferError::NotFound(m)),
        other => Err(TransferError::Protocol(format!("unexpected {} to GET_CHUNK", other.kind()))),
    }
}
