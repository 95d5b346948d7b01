//! Signal-of-Stop: cooperative cancellation primitive.
//!
//! Provides a thread-safe, async-aware cancellation token that can be:
//! - Cloned and shared across tasks and blocking workers
//! - Awaited for cancellation notification
//! - Linked to a parent so that stopping a node stops every task it spawned
//!
//! Blocking code (hashing, disk copies) polls [`SignalOfStop::cancelled`]
//! between iterations; async code awaits [`SignalOfStop::wait`] or races a
//! future with [`SignalOfStop::select`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;

/// A cooperative cancellation token.
///
/// Clones share the same underlying state, so cancelling any clone
/// notifies all waiters. Cancelling a token also cancels every child
/// created from it with [`SignalOfStop::child`], but never its parent.
#[derive(Debug, Default, Clone)]
pub struct SignalOfStop {
    internal: Arc<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    closing: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<SharedState>>>,
}

impl SharedState {
    fn cancel(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.notify.notify_waiters();

        let children = match self.children.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

impl SignalOfStop {
    /// Create a new, uncancelled signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a token that is cancelled together with `self`.
    ///
    /// Cancelling the child leaves the parent untouched. A child created
    /// from an already-cancelled parent starts cancelled.
    pub fn child(&self) -> Self {
        let child = Self::new();
        if self.cancelled() {
            child.cancel();
            return child;
        }
        let mut children = match self.internal.children.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        children.retain(|w| w.strong_count() > 0);
        children.push(Arc::downgrade(&child.internal));
        drop(children);

        // Parent may have been cancelled between the check and the push.
        if self.cancelled() {
            child.cancel();
        }
        child
    }

    /// Signal cancellation to all waiters and children.
    pub fn cancel(&self) {
        self.internal.cancel();
    }

    /// Check if cancellation has been signaled.
    pub fn cancelled(&self) -> bool {
        self.internal.closing.load(Ordering::Acquire)
    }

    /// Wait for cancellation to be signaled.
    ///
    /// Returns immediately if already cancelled.
    pub async fn wait(&self) {
        let notified = self.internal.notify.notified();
        tokio::pin!(notified);
        // Register interest before checking the flag so a concurrent
        // cancel cannot slip between the two.
        notified.as_mut().enable();
        if self.cancelled() {
            return;
        }
        notified.await;
    }

    /// Race a future against cancellation.
    ///
    /// Returns `Some(T)` if the future completes first, `None` if
    /// cancellation is signaled first.
    pub async fn select<F>(&self, fut: F) -> Option<F::Output>
    where
        F: Future,
    {
        tokio::select! {
            res = fut => Some(res),
            _ = self.wait() => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_returns_after_cancel() {
        let sos = SignalOfStop::new();
        let waiter = sos.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        sos.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[test]
    fn test_child_follows_parent() {
        let parent = SignalOfStop::new();
        let child = parent.child();
        let grandchild = child.child();
        assert!(!child.cancelled());

        parent.cancel();
        assert!(child.cancelled());
        assert!(grandchild.cancelled());
    }

    #[test]
    fn test_child_cancel_does_not_reach_parent() {
        let parent = SignalOfStop::new();
        let child = parent.child();
        child.cancel();
        assert!(child.cancelled());
        assert!(!parent.cancelled());
    }

    #[tokio::test]
    async fn test_select_cancelled() {
        let sos = SignalOfStop::new();
        sos.cancel();
        let out = sos.select(tokio::time::sleep(Duration::from_secs(5))).await;
        assert!(out.is_none());

        let live = SignalOfStop::new();
        assert_eq!(live.select(async { 7 }).await, Some(7));
    }
}
