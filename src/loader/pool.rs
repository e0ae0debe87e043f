use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Workers that stay alive even when idle.
const CORE_WORKERS: usize = 2;

/// How long a surplus worker waits for new work before exiting.
const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Work accepted by the [`WorkerPool`].
pub trait PoolJob: Send + Sync + 'static {
    /// Executes the job on a worker.
    fn run(self: Arc<Self>) -> BoxFuture<'static, ()>;

    /// Called instead of [`run`](PoolJob::run) when the job is removed from
    /// the queue before any worker picked it up.
    fn cancelled(self: Arc<Self>);
}

/// A bounded executor draining its queue newest-first.
///
/// Recently submitted jobs run first: a user panning a map floods the queue
/// with requests that are mostly obsolete by the time a worker frees up, and
/// the newest ones are what they are still looking at. Workers scale between
/// [`CORE_WORKERS`] and the configured maximum and shrink back after
/// [`KEEP_ALIVE`] of idleness. Only queued jobs can be cancelled; running
/// jobs always finish so their result can still be cached.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    queue: Mutex<VecDeque<Arc<dyn PoolJob>>>,
    wakeup: Notify,
    runtime: tokio::runtime::Handle,
    max_workers: usize,
    workers: AtomicUsize,
    idle: AtomicUsize,
}

impl std::fmt::Debug for PoolInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolInner")
            .field("queued", &self.queue.lock().len())
            .field("workers", &self.workers.load(Ordering::Relaxed))
            .field("idle", &self.idle.load(Ordering::Relaxed))
            .field("max_workers", &self.max_workers)
            .finish()
    }
}

impl WorkerPool {
    /// Creates a pool running at most `max_workers` jobs concurrently on the
    /// current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(max_workers: usize) -> Self {
        Self::with_runtime(max_workers, tokio::runtime::Handle::current())
    }

    pub fn with_runtime(max_workers: usize, runtime: tokio::runtime::Handle) -> Self {
        WorkerPool {
            inner: Arc::new(PoolInner {
                queue: Mutex::new(VecDeque::new()),
                wakeup: Notify::new(),
                runtime,
                max_workers: max_workers.max(1),
                workers: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
            }),
        }
    }

    /// Enqueues a job. The next free worker takes the newest queue entry.
    pub fn execute(&self, job: Arc<dyn PoolJob>) {
        let inner = &self.inner;
        inner.queue.lock().push_back(job);

        if inner.idle.load(Ordering::SeqCst) == 0 {
            self.try_spawn_worker();
        }
        inner.wakeup.notify_one();
    }

    /// Removes every job still waiting in the queue and reports each as
    /// cancelled. Jobs already running are not interrupted.
    pub fn cancel_outstanding_tasks(&self) {
        let drained: Vec<_> = self.inner.queue.lock().drain(..).collect();
        for job in drained {
            job.cancelled();
        }
    }

    /// Jobs waiting in the queue (not yet taken by a worker).
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().len()
    }

    fn try_spawn_worker(&self) {
        let inner = &self.inner;
        let mut workers = inner.workers.load(Ordering::SeqCst);
        loop {
            if workers >= inner.max_workers {
                return;
            }
            match inner.workers.compare_exchange(
                workers,
                workers + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(current) => workers = current,
            }
        }

        let inner = Arc::clone(inner);
        self.inner.runtime.spawn(worker_loop(inner));
    }
}

async fn worker_loop(inner: Arc<PoolInner>) {
    let core = CORE_WORKERS.min(inner.max_workers);
    loop {
        let job = inner.queue.lock().pop_back();
        if let Some(job) = job {
            job.run().await;
            continue;
        }

        inner.idle.fetch_add(1, Ordering::SeqCst);
        let timed_out = tokio::time::timeout(KEEP_ALIVE, inner.wakeup.notified())
            .await
            .is_err();
        inner.idle.fetch_sub(1, Ordering::SeqCst);

        if timed_out && inner.workers.load(Ordering::SeqCst) > core {
            // Deregister before the final queue check so a submission racing
            // with the shutdown spawns a replacement worker.
            inner.workers.fetch_sub(1, Ordering::SeqCst);
            if inner.queue.lock().is_empty() {
                return;
            }
            inner.workers.fetch_add(1, Ordering::SeqCst);
        }
    }
}
