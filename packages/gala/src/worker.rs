//! Job worker that replays durable envelopes.
//!
//! The `JobWorker` is a long-running service that:
//! - Polls each configured queue through a `JobStore`
//! - Runs up to the queue's worker count of jobs concurrently
//! - Hands dispatch jobs to a `DispatchWorker`
//! - Marks jobs succeeded or failed, classifying failures as retryable or not
//! - Sends heartbeats for long-running jobs
//!
//! # Architecture
//!
//! ```text
//! JobWorker
//!     │
//!     ├─► one poll loop per queue (claim_ready, limit = queue workers)
//!     ├─► DispatchWorker::work(job)
//!     │       └─► Runtime::dispatch_envelope (cancellation stripped)
//!     └─► mark_succeeded / mark_failed(FailureKind)
//! ```
//!
//! # Example
//!
//! ```ignore
//! let queue = Arc::new(MemoryJobQueue::new());
//! let worker = JobWorker::with_config(
//!     queue.clone(),
//!     DispatchWorker::new(runtime.clone()),
//!     JobWorkerConfig::for_queues([("gala", 4), ("integrations", 2)]),
//! );
//!
//! let shutdown = CancellationToken::new();
//! tokio::spawn({
//!     let shutdown = shutdown.clone();
//!     async move { worker.run(shutdown).await }
//! });
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::Context;
use crate::job::{failure_kind, ClaimedJob, DispatchWorker, FailureKind, JobStore, DEFAULT_QUEUE_NAME};

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// Queue name to concurrent job count
    pub queues: BTreeMap<String, usize>,
    /// How long to wait when a queue is empty
    pub poll_interval: Duration,
    /// Pause between fetches while a queue has work
    pub fetch_cooldown: Duration,
    /// How often to send heartbeats for running jobs
    pub heartbeat_interval: Duration,
    /// Worker ID for this instance
    pub worker_id: String,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            queues: BTreeMap::from([(DEFAULT_QUEUE_NAME.to_string(), 10)]),
            poll_interval: Duration::from_secs(1),
            fetch_cooldown: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(30),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

impl JobWorkerConfig {
    /// Config polling the given queues. Blank names and zero counts are dropped.
    pub fn for_queues<I, S>(queues: I) -> Self
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        let queues = queues
            .into_iter()
            .map(|(name, workers)| (name.into().trim().to_string(), workers))
            .filter(|(name, workers)| !name.is_empty() && *workers > 0)
            .collect();

        Self {
            queues,
            ..Default::default()
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }
}

pub struct JobWorker {
    store: Arc<dyn JobStore>,
    handler: DispatchWorker,
    config: JobWorkerConfig,
    /// Track running jobs for cancellation
    running_jobs: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
}

impl JobWorker {
    pub fn new(store: Arc<dyn JobStore>, handler: DispatchWorker) -> Self {
        Self::with_config(store, handler, JobWorkerConfig::default())
    }

    pub fn with_config(store: Arc<dyn JobStore>, handler: DispatchWorker, config: JobWorkerConfig) -> Self {
        Self {
            store,
            handler,
            config,
            running_jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &JobWorkerConfig {
        &self.config
    }

    /// Number of jobs currently executing.
    pub async fn running(&self) -> usize {
        self.running_jobs.read().await.len()
    }

    /// Poll every configured queue until `shutdown` fires. Jobs already
    /// claimed finish before this returns.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            queues = ?self.config.queues,
            "gala job worker starting"
        );

        let loops = self
            .config
            .queues
            .iter()
            .map(|(queue, workers)| self.run_queue(queue, *workers, &shutdown));
        futures::future::join_all(loops).await;

        info!(worker_id = %self.config.worker_id, "gala job worker stopped");
        Ok(())
    }

    async fn run_queue(&self, queue: &str, workers: usize, shutdown: &CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let pause = match self.run_once(queue, workers, shutdown).await {
                Ok(0) => self.config.poll_interval,
                Ok(_) => self.config.fetch_cooldown,
                Err(e) => {
                    error!(queue = %queue, error = %e, "failed to claim jobs");
                    Duration::from_secs(1)
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Claim and process one batch from `queue`. Returns how many jobs ran.
    pub async fn run_once(&self, queue: &str, limit: usize, shutdown: &CancellationToken) -> Result<usize> {
        let jobs = self
            .store
            .claim_ready(queue, &self.config.worker_id, limit.max(1))
            .await?;

        if jobs.is_empty() {
            return Ok(0);
        }

        let count = jobs.len();
        debug!(queue = %queue, count, "claimed jobs");

        let handles = jobs.into_iter().map(|job| self.process_job(job, shutdown));
        futures::future::join_all(handles).await;

        Ok(count)
    }

    /// Process a single claimed job.
    async fn process_job(&self, job: ClaimedJob, shutdown: &CancellationToken) {
        let job_id = job.id;

        if job.kind != self.handler.kind() {
            error!(job_id = %job_id, kind = %job.kind, "unknown job kind");
            let message = format!("unknown job kind: {}", job.kind);
            if let Err(e) = self
                .store
                .mark_failed(job_id, &message, FailureKind::NonRetryable)
                .await
            {
                error!(job_id = %job_id, error = %e, "failed to mark job as failed");
            }
            return;
        }

        let job_cancel = shutdown.child_token();
        self.running_jobs.write().await.insert(job_id, job_cancel.clone());

        let result = self.execute_with_heartbeat(&job, job_cancel).await;

        match result {
            Ok(()) => {
                debug!(job_id = %job_id, queue = %job.queue, attempt = job.attempt, "job succeeded");
                if let Err(e) = self.store.mark_succeeded(job_id).await {
                    error!(job_id = %job_id, error = %e, "failed to mark job as succeeded");
                }
            }
            Err(e) => {
                let kind = failure_kind(&e);
                warn!(
                    job_id = %job_id,
                    queue = %job.queue,
                    attempt = job.attempt,
                    max_attempts = job.max_attempts,
                    retryable = kind == FailureKind::Retryable,
                    error = %e,
                    "job failed"
                );
                if let Err(mark_err) = self.store.mark_failed(job_id, &e.to_string(), kind).await {
                    error!(job_id = %job_id, error = %mark_err, "failed to mark job as failed");
                }
            }
        }

        self.running_jobs.write().await.remove(&job_id);
    }

    /// Execute a job with periodic heartbeats.
    async fn execute_with_heartbeat(
        &self,
        job: &ClaimedJob,
        cancel: CancellationToken,
    ) -> crate::error::Result<()> {
        let store = self.store.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        let job_id = job.id;

        let heartbeat_cancel = cancel.clone();
        let heartbeat_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = heartbeat_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = store.heartbeat(job_id).await {
                            warn!(job_id = %job_id, error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        });

        let ctx = Context::background().with_cancellation(cancel.clone());
        let result = self.handler.work(&ctx, job).await;

        cancel.cancel();
        let _ = heartbeat_handle.await;

        result
    }
}

impl std::fmt::Debug for JobWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobWorker").field("config", &self.config).finish()
    }
}
