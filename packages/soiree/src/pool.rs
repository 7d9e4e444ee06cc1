//! Bounded worker pool used for asynchronous emission.
//!
//! Submitted tasks are spawned immediately but only run while holding one of
//! `max_workers` permits, so a saturated pool queues new work behind the
//! tasks already running.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error};

/// Default worker count when none is configured.
pub const DEFAULT_MAX_WORKERS: usize = 100;

#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: String,
    max_workers: usize,
    permits: Arc<Semaphore>,
    pending: AtomicUsize,
    idle: Notify,
    released: AtomicBool,
}

impl Pool {
    pub fn new(max_workers: usize) -> Self {
        Self::builder().max_workers(max_workers).build()
    }

    pub fn builder() -> PoolBuilder {
        PoolBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    /// Tasks currently holding a worker slot.
    pub fn running(&self) -> usize {
        self.inner.max_workers - self.inner.permits.available_permits()
    }

    /// Tasks submitted and not yet finished, running or queued.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Queue a task. Returns `false` when the pool has been released.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_released() {
            debug!(pool = %self.inner.name, "task rejected by released pool");
            return false;
        }

        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.clone();

        tokio::spawn(async move {
            if let Ok(_permit) = inner.permits.clone().acquire_owned().await {
                if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
                    error!(
                        pool = %inner.name,
                        panic = %panic_message(panic.as_ref()),
                        "pool task panicked"
                    );
                }
            }

            if inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.idle.notify_waiters();
            }
        });

        true
    }

    /// Submit every task and wait for all of them to finish.
    pub async fn submit_and_wait<I, F>(&self, tasks: I)
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = ()> + Send + 'static,
    {
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        let mut submitted = 0usize;

        for task in tasks {
            let done = done_tx.clone();
            let accepted = self.submit(async move {
                task.await;
                let _ = done.send(());
            });
            if accepted {
                submitted += 1;
            }
        }
        drop(done_tx);

        for _ in 0..submitted {
            if done_rx.recv().await.is_none() {
                break;
            }
        }
    }

    /// Wait until no submitted task is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let mut notified = pin!(self.inner.idle.notified());
            notified.as_mut().enable();

            if self.pending() == 0 {
                return;
            }

            notified.await;
        }
    }

    /// Stop accepting work. Tasks already submitted still run to completion.
    pub fn release(&self) {
        if !self.inner.released.swap(true, Ordering::SeqCst) {
            debug!(pool = %self.inner.name, "pool released");
        }
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("max_workers", &self.inner.max_workers)
            .field("pending", &self.pending())
            .finish()
    }
}

/// Builder for [`Pool`].
#[derive(Debug, Clone)]
pub struct PoolBuilder {
    name: String,
    max_workers: usize,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self {
            name: "soiree".to_string(),
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

impl PoolBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Worker count; values below 1 are raised to 1.
    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn build(self) -> Pool {
        Pool {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(self.max_workers)),
                name: self.name,
                max_workers: self.max_workers,
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                released: AtomicBool::new(false),
            }),
        }
    }
}

/// Render a caught panic payload as text.
pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_wait_idle_on_empty_pool_returns() {
        let pool = Pool::new(2);
        tokio::time::timeout(Duration::from_secs(1), pool.wait_idle())
            .await
            .expect("idle pool should not block");
    }

    #[tokio::test]
    async fn test_saturated_pool_queues_second_task() {
        let pool = Pool::new(1);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (second_tx, mut second_rx) = oneshot::channel::<()>();

        assert!(pool.submit(async move {
            let _ = release_rx.await;
        }));
        assert!(pool.submit(async move {
            let _ = second_tx.send(());
        }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(second_rx.try_recv().is_err(), "second task ran while pool was saturated");
        assert_eq!(pool.running(), 1);

        release_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), second_rx)
            .await
            .expect("second task should run after the first finishes")
            .unwrap();

        pool.wait_idle().await;
        assert_eq!(pool.pending(), 0);
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_wedge_pool() {
        let pool = Pool::new(1);
        pool.submit(async { panic!("boom") });

        tokio::time::timeout(Duration::from_secs(1), pool.wait_idle())
            .await
            .expect("pool should drain after a panic");
        assert_eq!(pool.running(), 0);
    }

    #[tokio::test]
    async fn test_released_pool_rejects_work() {
        let pool = Pool::builder().name("closing").max_workers(0).build();
        assert_eq!(pool.max_workers(), 1);

        pool.release();
        assert!(!pool.submit(async {}));
        assert_eq!(pool.pending(), 0);
    }

    #[tokio::test]
    async fn test_submit_and_wait_runs_all_tasks() {
        let pool = Pool::new(3);
        let counter = Arc::new(AtomicUsize::new(0));

        let tasks = (0..10).map(|_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        pool.submit_and_wait(tasks).await;

        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }
}
