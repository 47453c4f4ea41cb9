//! A small cancellation token, used to thread shutdown from the node
//! down through the engine, per-Application workers, and driver calls.
//!
//! This is deliberately minimal rather than pulling in `tokio-util`:
//! the teacher crate drives its own scheduler shutdown with a plain
//! `tokio::sync::broadcast` channel (see `IntervalScheduler`), and this
//! token follows the same idea, just packaged as a value that can be
//! cloned and awaited on directly.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::sync::RwLock;

/// A cooperatively-checked cancellation signal. Clones share the same
/// underlying state; cancelling any clone cancels all of them.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: RwLock<bool>,
    notify: Notify,
}

impl CancellationToken {
    /// Create a fresh, non-cancelled token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: RwLock::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Derive a child token. Cancelling the parent cancels the child,
    /// but cancelling the child does not affect the parent or its
    /// siblings. Useful for scoping a single Application worker's
    /// lifetime to the engine's overall shutdown.
    pub fn child(&self) -> Self {
        let child = Self::new();
        let parent = self.clone();
        let child_clone = child.clone();
        tokio::spawn(async move {
            parent.cancelled().await;
            child_clone.cancel();
        });
        child
    }

    /// Signal cancellation to this token and all of its clones.
    pub fn cancel(&self) {
        let inner = self.inner.clone();
        // Acquiring the write lock synchronously here would require an
        // async context; spawn a short task instead so `cancel` stays
        // callable from sync code paths (e.g. `Drop` impls).
        tokio::spawn(async move {
            let mut guard = inner.cancelled.write().await;
            *guard = true;
            inner.notify.notify_waiters();
        });
    }

    /// Whether cancellation has already been signalled.
    pub async fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.read().await
    }

    /// Resolve once cancellation has been signalled. Safe to call
    /// concurrently from multiple tasks, and safe to call after
    /// cancellation already happened (resolves immediately).
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled().await {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled().await {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should resolve after cancel")
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_if_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("already-cancelled token resolves immediately");
    }

    #[tokio::test]
    async fn child_token_cancelled_when_parent_is() {
        let parent = CancellationToken::new();
        let child = parent.child();
        tokio::time::sleep(Duration::from_millis(10)).await;
        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), child.cancelled())
            .await
            .expect("child token cancels with parent");
    }
}
