//! Transfer tasks: the unit of progress tracking for one share or download.
//!
//! A task owns:
//! - State management (lifecycle transitions, enforced)
//! - Progress (bytes / total, verified chunk indices)
//! - Liveness (last activity, stall threshold)
//!
//! Tasks are created by the download manager or the share path and are
//! destroyed only by explicit cleanup after reaching a terminal state.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

// ── Task State Machine ───────────────────────────────────────────────────────

/// All possible states a task can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Created; metadata or hashing not yet under way.
    Starting,
    /// Chunks are being fetched.
    Downloading,
    /// Local file is being hashed and announced.
    Sharing,
    /// Explicitly paused between chunks.
    Paused,
    /// No activity within the stall threshold.
    Timeout,
    /// Rebuilt from resume metadata after a restart.
    Resumable,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// States a download may be resumed from, given verified-chunk state.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            TaskState::Paused | TaskState::Timeout | TaskState::Resumable
        )
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Cancelled) | (_, Failed) => true,
            (Starting, Downloading) | (Starting, Sharing) => true,
            (Downloading, Completed) | (Downloading, Paused) | (Downloading, Timeout) => true,
            (Sharing, Completed) | (Sharing, Timeout) => true,
            // The last in-flight chunk may land after a pause or stall signal.
            (Paused, Completed) | (Timeout, Completed) => true,
            (Paused, Downloading) | (Resumable, Downloading) => true,
            (Timeout, Downloading) | (Timeout, Sharing) => true,
            _ => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskState::Starting => "starting",
            TaskState::Downloading => "downloading",
            TaskState::Sharing => "sharing",
            TaskState::Paused => "paused",
            TaskState::Timeout => "timeout",
            TaskState::Resumable => "resumable",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    Share,
    Download,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("no task with id {0}")]
    UnknownTask(u64),
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: TaskState, to: TaskState },
}

// ── Task ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TransferTask {
    pub id: u64,
    pub kind: TaskKind,
    pub name: String,
    pub digest: String,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub state: TaskState,
    /// Save path for downloads, source path for shares.
    pub path: PathBuf,
    pub verified_chunks: BTreeSet<u32>,
    pub last_activity: Instant,
    /// Stall threshold.
    pub timeout: Duration,
    pub failure: Option<String>,
}

impl TransferTask {
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return if self.state == TaskState::Completed { 100.0 } else { 0.0 };
        }
        (self.bytes_transferred as f64 / self.total_bytes as f64) * 100.0
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn transition(&mut self, next: TaskState) -> Result<(), TaskError> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(TaskError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.touch();
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.transition(TaskState::Failed).is_ok() {
            self.failure = Some(reason.into());
        }
    }

    /// Record a verified chunk of `len` bytes. Returns false if the index
    /// was already recorded, in which case counters are unchanged.
    pub fn record_chunk(&mut self, index: u32, len: u64) -> bool {
        if !self.verified_chunks.insert(index) {
            return false;
        }
        self.bytes_transferred = (self.bytes_transferred + len).min(self.total_bytes);
        self.touch();
        true
    }

    /// Set byte progress for tasks that do not move chunks (hashing).
    /// Progress never goes backwards and never exceeds the total.
    pub fn advance_to(&mut self, bytes: u64) {
        let bytes = bytes.min(self.total_bytes);
        if bytes > self.bytes_transferred {
            self.bytes_transferred = bytes;
        }
        self.touch();
    }

    pub fn is_stalled(&self, now: Instant) -> bool {
        matches!(self.state, TaskState::Downloading | TaskState::Sharing)
            && now.saturating_duration_since(self.last_activity) > self.timeout
    }
}

impl fmt::Display for TransferTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {:?} {} [{}] {:.1}% ({}/{} bytes)",
            self.id,
            self.kind,
            self.name,
            self.state,
            self.percentage(),
            self.bytes_transferred,
            self.total_bytes
        )?;
        if let Some(reason) = &self.failure {
            write!(f, " - {reason}")?;
        }
        Ok(())
    }
}

/// Parameters for a new task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub kind: TaskKind,
    pub name: String,
    pub digest: String,
    pub total_bytes: u64,
    pub path: PathBuf,
    pub timeout: Duration,
    pub state: TaskState,
    pub verified_chunks: BTreeSet<u32>,
    pub bytes_transferred: u64,
}

impl NewTask {
    pub fn new(kind: TaskKind, name: String, digest: String, total_bytes: u64, path: PathBuf, timeout: Duration) -> Self {
        Self {
            kind,
            name,
            digest,
            total_bytes,
            path,
            timeout,
            state: TaskState::Starting,
            verified_chunks: BTreeSet::new(),
            bytes_transferred: 0,
        }
    }
}

// ── Task Manager ─────────────────────────────────────────────────────────────

/// Registry of all tasks, keyed by monotonic id.
#[derive(Debug)]
pub struct TaskManager {
    tasks: Mutex<BTreeMap<u64, TransferTask>>,
    next_id: AtomicU64,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, TransferTask>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn create(&self, new_task: NewTask) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = TransferTask {
            id,
            kind: new_task.kind,
            name: new_task.name,
            digest: new_task.digest,
            bytes_transferred: new_task.bytes_transferred.min(new_task.total_bytes),
            total_bytes: new_task.total_bytes,
            state: new_task.state,
            path: new_task.path,
            verified_chunks: new_task.verified_chunks,
            last_activity: Instant::now(),
            timeout: new_task.timeout,
            failure: None,
        };
        self.lock().insert(id, task);
        id
    }

    pub fn get(&self, id: u64) -> Option<TransferTask> {
        self.lock().get(&id).cloned()
    }

    pub fn list(&self) -> Vec<TransferTask> {
        self.lock().values().cloned().collect()
    }

    pub fn state(&self, id: u64) -> Option<TaskState> {
        self.lock().get(&id).map(|t| t.state)
    }

    /// Apply `f` to the task under the lock.
    pub fn update<R>(&self, id: u64, f: impl FnOnce(&mut TransferTask) -> R) -> Result<R, TaskError> {
        let mut tasks = self.lock();
        let task = tasks.get_mut(&id).ok_or(TaskError::UnknownTask(id))?;
        Ok(f(task))
    }

    pub fn transition(&self, id: u64, next: TaskState) -> Result<(), TaskError> {
        self.update(id, |t| t.transition(next))?
    }

    /// Remove a terminal task. Non-terminal and unknown ids are left alone.
    pub fn remove_terminal(&self, id: u64) -> Option<TransferTask> {
        let mut tasks = self.lock();
        if tasks.get(&id).is_some_and(|t| t.state.is_terminal()) {
            return tasks.remove(&id);
        }
        None
    }

    /// Flip every stalled `Downloading`/`Sharing` task to `Timeout`.
    /// Returns the affected ids. Verified chunks are untouched.
    pub fn mark_stalled(&self, now: Instant) -> Vec<u64> {
        let mut tasks = self.lock();
        let mut flipped = Vec::new();
        for task in tasks.values_mut() {
            if task.is_stalled(now) {
                task.state = TaskState::Timeout;
                flipped.push(task.id);
            }
        }
        flipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn download(mgr: &TaskManager, total: u64) -> u64 {
        mgr.create(NewTask::new(
            TaskKind::Download,
            "file.bin".into(),
            "abc".into(),
            total,
            PathBuf::from("/tmp/file.bin"),
            Duration::from_secs(60),
        ))
    }

    #[test]
    fn test_ids_are_monotonic() {
        let mgr = TaskManager::new();
        let a = download(&mgr, 10);
        let b = download(&mgr, 10);
        assert!(b > a);
    }

    #[test]
    fn test_happy_path_transitions() {
        let mgr = TaskManager::new();
        let id = download(&mgr, 10);
        mgr.transition(id, TaskState::Downloading).unwrap();
        mgr.transition(id, TaskState::Paused).unwrap();
        mgr.transition(id, TaskState::Downloading).unwrap();
        mgr.transition(id, TaskState::Completed).unwrap();
        assert_eq!(mgr.state(id), Some(TaskState::Completed));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mgr = TaskManager::new();
        let id = download(&mgr, 10);
        mgr.transition(id, TaskState::Cancelled).unwrap();
        let err = mgr.transition(id, TaskState::Downloading).unwrap_err();
        assert_eq!(
            err,
            TaskError::IllegalTransition {
                from: TaskState::Cancelled,
                to: TaskState::Downloading
            }
        );
        assert!(mgr.transition(id, TaskState::Failed).is_err());
    }

    #[test]
    fn test_illegal_edges_rejected() {
        assert!(!TaskState::Starting.can_transition_to(TaskState::Completed));
        assert!(!TaskState::Sharing.can_transition_to(TaskState::Paused));
        assert!(!TaskState::Resumable.can_transition_to(TaskState::Sharing));
        assert!(TaskState::Resumable.can_transition_to(TaskState::Cancelled));
        assert!(TaskState::Timeout.can_transition_to(TaskState::Downloading));
        assert!(!TaskState::Resumable.can_transition_to(TaskState::Completed));
    }

    #[test]
    fn test_stalled_or_paused_download_can_still_complete() {
        let mgr = TaskManager::new();
        let id = download(&mgr, 10);
        mgr.transition(id, TaskState::Downloading).unwrap();
        let later = Instant::now() + Duration::from_secs(3600);
        assert_eq!(mgr.mark_stalled(later), vec![id]);
        mgr.transition(id, TaskState::Completed).unwrap();

        let id = download(&mgr, 10);
        mgr.transition(id, TaskState::Downloading).unwrap();
        mgr.transition(id, TaskState::Paused).unwrap();
        mgr.transition(id, TaskState::Completed).unwrap();
        assert_eq!(mgr.state(id), Some(TaskState::Completed));
    }

    #[test]
    fn test_progress_is_monotonic_and_bounded() {
        let mgr = TaskManager::new();
        let id = download(&mgr, 25);
        mgr.update(id, |t| {
            assert!(t.record_chunk(0, 10));
            assert!(!t.record_chunk(0, 10));
            assert_eq!(t.bytes_transferred, 10);
            t.record_chunk(1, 10);
            t.record_chunk(2, 10);
            assert_eq!(t.bytes_transferred, 25);
            t.advance_to(5);
            assert_eq!(t.bytes_transferred, 25);
        })
        .unwrap();
        let task = mgr.get(id).unwrap();
        assert_eq!(task.percentage(), 100.0);
    }

    #[test]
    fn test_stalled_tasks_flip_to_timeout() {
        let mgr = TaskManager::new();
        let id = download(&mgr, 10);
        let idle = download(&mgr, 10);
        mgr.transition(id, TaskState::Downloading).unwrap();
        mgr.update(id, |t| {
            t.record_chunk(0, 5);
            t.timeout = Duration::from_millis(1);
        })
        .unwrap();

        let later = Instant::now() + Duration::from_millis(50);
        assert_eq!(mgr.mark_stalled(later), vec![id]);
        let task = mgr.get(id).unwrap();
        assert_eq!(task.state, TaskState::Timeout);
        assert!(task.verified_chunks.contains(&0));
        assert_eq!(mgr.state(idle), Some(TaskState::Starting));
    }

    #[test]
    fn test_remove_only_terminal() {
        let mgr = TaskManager::new();
        let id = download(&mgr, 10);
        assert!(mgr.remove_terminal(id).is_none());
        mgr.update(id, |t| t.fail("disk full")).unwrap();
        let removed = mgr.remove_terminal(id).unwrap();
        assert_eq!(removed.failure.as_deref(), Some("disk full"));
        assert!(mgr.get(id).is_none());
        assert!(mgr.remove_terminal(id).is_none());
    }
}
