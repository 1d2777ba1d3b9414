//! Bounded Worker Pool
//!
//! Runs scheduled job bodies and cache materializations with a concurrency
//! limit that follows load.
//!
//! # Sizing
//!
//! The pool holds one semaphore permit per worker. Every task start and
//! completion re-evaluates the size:
//!
//! - grow by one while demand (running plus queued tasks) reaches the current
//!   size, never past the ceiling
//! - shrink by one while demand is below the current size, never below one
//!
//! Tasks beyond the current size queue on the semaphore.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Worker pool error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The pool no longer accepts tasks.
    #[error("worker pool is shutting down")]
    ShuttingDown,
}

/// Result of one sizing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    /// One worker was added.
    Grew,
    /// One worker was removed.
    Shrank,
    /// Size already matches demand.
    Unchanged,
    /// Demand wants more workers but the ceiling is reached.
    AtCeiling,
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    /// Current number of workers.
    pub size: usize,
    /// Hard ceiling on workers.
    pub ceiling: usize,
    /// Tasks holding a worker.
    pub running: usize,
    /// Tasks waiting for a worker.
    pub queued: usize,
    /// Tasks finished since start.
    pub completed: u64,
}

#[derive(Debug)]
struct PoolInner {
    permits: Semaphore,
    size: AtomicUsize,
    demand: AtomicUsize,
    running: AtomicUsize,
    completed: AtomicU64,
    ceiling: usize,
    sizing: Mutex<()>,
    closed: AtomicBool,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

/// Counts a task as running until dropped, including when it is cancelled.
struct RunningSlot<'a> {
    running: &'a AtomicUsize,
}

impl<'a> RunningSlot<'a> {
    fn enter(running: &'a AtomicUsize) -> Self {
        running.fetch_add(1, Ordering::SeqCst);
        Self { running }
    }
}

impl Drop for RunningSlot<'_> {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Load-following worker pool.
///
/// Cloning shares the same pool.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a pool with one worker that may grow to `ceiling`.
    #[must_use]
    pub fn new(ceiling: usize) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            inner: Arc::new(PoolInner {
                permits: Semaphore::new(1),
                size: AtomicUsize::new(1),
                demand: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
                ceiling,
                sizing: Mutex::new(()),
                closed: AtomicBool::new(false),
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Submit a task.
    ///
    /// The handle resolves to `None` if the task was cancelled by a forced
    /// shutdown before finishing.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::ShuttingDown`] once [`shutdown`](Self::shutdown)
    /// has been called.
    pub fn spawn<F>(&self, task: F) -> Result<JoinHandle<Option<F::Output>>, PoolError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::ShuttingDown);
        }

        self.inner.demand.fetch_add(1, Ordering::SeqCst);
        self.adjust();

        let inner = Arc::clone(&self.inner);
        let pool = self.clone();
        Ok(self.inner.tracker.spawn(async move {
            let output = tokio::select! {
                () = inner.cancel.cancelled() => None,
                output = pool.run_with_permit(task) => output,
            };

            inner.demand.fetch_sub(1, Ordering::SeqCst);
            pool.adjust();
            output
        }))
    }

    async fn run_with_permit<F: Future>(&self, task: F) -> Option<F::Output> {
        let permit = self.inner.permits.acquire().await.ok()?;
        let running = RunningSlot::enter(&self.inner.running);

        let output = task.await;

        drop(running);
        self.inner.completed.fetch_add(1, Ordering::Relaxed);
        drop(permit);
        Some(output)
    }

    /// Apply one hill-climbing step.
    pub fn adjust(&self) -> Adjustment {
        let _guard = self.inner.sizing.lock();
        let size = self.inner.size.load(Ordering::SeqCst);
        let demand = self.inner.demand.load(Ordering::SeqCst);

        let adjustment = if demand >= size {
            if size < self.inner.ceiling {
                self.inner.permits.add_permits(1);
                self.inner.size.store(size + 1, Ordering::SeqCst);
                Adjustment::Grew
            } else if demand > size {
                Adjustment::AtCeiling
            } else {
                Adjustment::Unchanged
            }
        } else if size > 1 && self.inner.permits.forget_permits(1) == 1 {
            self.inner.size.store(size - 1, Ordering::SeqCst);
            Adjustment::Shrank
        } else {
            Adjustment::Unchanged
        };

        let new_size = self.inner.size.load(Ordering::SeqCst);
        if adjustment != Adjustment::Unchanged {
            tracing::debug!(?adjustment, size = new_size, demand, "Worker pool resized");
        }
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("worker_pool_size").set(new_size as f64);

        adjustment
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let running = self.inner.running.load(Ordering::SeqCst);
        let demand = self.inner.demand.load(Ordering::SeqCst);
        PoolStats {
            size: self.inner.size.load(Ordering::SeqCst),
            ceiling: self.inner.ceiling,
            running,
            queued: demand.saturating_sub(running),
            completed: self.inner.completed.load(Ordering::Relaxed),
        }
    }

    /// Whether the pool still accepts tasks.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop accepting tasks and wait for in-flight ones.
    ///
    /// Tasks still running after `timeout` are cancelled. Returns `true` if
    /// every task finished on its own.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.tracker.close();

        if tokio::time::timeout(timeout, self.inner.tracker.wait())
            .await
            .is_ok()
        {
            tracing::info!("Worker pool drained");
            return true;
        }

        let remaining = self.inner.tracker.len();
        tracing::warn!(remaining, "Worker pool drain timed out, cancelling tasks");
        self.inner.cancel.cancel();
        self.inner.tracker.wait().await;
        false
    }
}
