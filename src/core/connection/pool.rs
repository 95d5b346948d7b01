//! Bounded pool for blocking work.
//!
//! Disk I/O, hashing, certificate signing and key generation never run on
//! the event-loop threads. They are handed to tokio's blocking threads, with
//! a semaphore capping how many run at once so a burst of chunk reads cannot
//! starve signing or hashing.

use crate::core::error::TransferError;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Run `job` on a blocking thread once a slot is free and await its
    /// result without blocking the caller's event loop.
    pub async fn run<F, T>(&self, job: F) -> Result<T, TransferError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| TransferError::Resource("worker pool closed".into()))?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|e| TransferError::Resource(format!("worker job aborted: {e}")))
    }

    /// Jobs currently holding a slot.
    pub fn busy(&self) -> usize {
        self.size - self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_returns_result() {
        let pool = WorkerPool::new(2);
        let out = pool.run(|| 21 * 2).await.unwrap();
        assert_eq!(out, 42);
        assert_eq!(pool.busy(), 0);
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                pool.run(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(30));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
