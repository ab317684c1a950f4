//! Completion primitives for requests.
//!
//! A [`WaitGroup`] is the Batch/Group handle attached to a request: the
//! router adds before enqueueing, the worker calls `done` at completion,
//! and the router awaits `wait`. Only these three operations exist.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Counter-plus-notify wait group, cloneable like a channel handle.
#[derive(Debug, Clone, Default)]
pub struct WaitGroup {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    count: AtomicI64,
    notify: Notify,
}

impl WaitGroup {
    pub fn new() -> WaitGroup {
        WaitGroup::default()
    }

    pub fn add(&self, n: i64) {
        self.inner.count.fetch_add(n, Ordering::AcqRel);
    }

    pub fn done(&self) {
        if self.inner.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.notify.notify_waiters();
        }
    }

    /// Resolves once the counter reaches zero. Ready immediately if it
    /// already has.
    pub async fn wait(&self) {
        loop {
            // register before checking, so a concurrent done() cannot
            // slip between the check and the await
            let notified = self.inner.notify.notified();
            if self.inner.count.load(Ordering::Acquire) <= 0 {
                return;
            }
            notified.await;
        }
    }
}
