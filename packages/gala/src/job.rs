//! Durable job boundary.
//!
//! gala depends on two narrow capabilities of a job system:
//!
//! - [`JobClient`] inserts a job (kind, argument bytes, queue, max attempts,
//!   tags, metadata). [`QueueDispatcher`] uses it to persist envelopes.
//! - [`JobStore`] lets a worker claim jobs and record outcomes.
//!   [`JobWorker`](crate::worker::JobWorker) polls it and hands each job to a
//!   [`DispatchWorker`], which replays the envelope through the runtime.
//!
//! [`MemoryJobQueue`] implements both in-process. Any durable backend that
//! satisfies the two traits is substitutable.
//!
//! ```text
//! Runtime ─► QueueDispatcher ─► JobClient::insert("gala_dispatch_v1", envelope bytes)
//!                                          │
//! JobWorker ◄─ JobStore::claim_ready ◄─────┘
//!     └─► DispatchWorker::work ─► Runtime::dispatch_envelope
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::context::Context;
use crate::dispatch::DurableDispatcher;
use crate::envelope::Envelope;
use crate::error::{GalaError, Result};
use crate::runtime::Runtime;
use crate::topic::{QueueClass, TopicPolicy};

/// Job kind for envelope dispatch jobs.
pub const DISPATCH_JOB_KIND: &str = "gala_dispatch_v1";

/// Queue used when nothing more specific applies.
pub const DEFAULT_QUEUE_NAME: &str = "gala";

/// Attempts allowed when neither the job nor the queue says otherwise.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 25;

/// Completed and discarded jobs a [`MemoryJobQueue`] keeps for inspection.
pub const DEFAULT_FINISHED_HISTORY: usize = 1_000;

// ============================================================================
// Insert side
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct JobInsert {
    pub kind: String,
    pub args: Vec<u8>,
    pub queue: String,
    pub max_attempts: Option<u32>,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

#[async_trait]
pub trait JobClient: Send + Sync {
    async fn insert(&self, job: JobInsert) -> anyhow::Result<Uuid>;
}

/// Argument payload of a dispatch job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchJobArgs {
    pub envelope: Envelope,
}

impl DispatchJobArgs {
    pub fn new(envelope: Envelope) -> Self {
        Self { envelope }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(GalaError::EnvelopeEncodeFailed)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(GalaError::JobEnvelopeRequired);
        }
        serde_json::from_slice(bytes).map_err(GalaError::EnvelopeDecodeFailed)
    }
}

/// Durable dispatcher that inserts one job per envelope.
///
/// Queue selection: the envelope's `queue` header, then the queue mapped to
/// the topic's [`QueueClass`], then the default queue.
pub struct QueueDispatcher {
    client: Arc<dyn JobClient>,
    default_queue: String,
    queue_by_class: HashMap<QueueClass, String>,
    max_attempts: Option<u32>,
}

impl QueueDispatcher {
    /// A blank `default_queue` falls back to [`DEFAULT_QUEUE_NAME`].
    pub fn new(client: Arc<dyn JobClient>, default_queue: impl Into<String>) -> Self {
        let default_queue = default_queue.into().trim().to_string();
        Self {
            client,
            default_queue: if default_queue.is_empty() {
                DEFAULT_QUEUE_NAME.to_string()
            } else {
                default_queue
            },
            queue_by_class: HashMap::new(),
            max_attempts: None,
        }
    }

    pub fn with_queue_for(mut self, class: QueueClass, queue: impl Into<String>) -> Self {
        self.queue_by_class.insert(class, queue.into());
        self
    }

    /// Max attempts applied when the envelope carries no override.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = (max_attempts > 0).then_some(max_attempts);
        self
    }

    pub fn default_queue(&self) -> &str {
        &self.default_queue
    }

    pub fn select_queue(&self, envelope: &Envelope, policy: &TopicPolicy) -> String {
        if let Some(queue) = non_blank(envelope.headers.queue.as_deref()) {
            return queue.to_string();
        }
        if let Some(queue) = non_blank(self.queue_by_class.get(&policy.queue_class).map(String::as_str)) {
            return queue.to_string();
        }
        self.default_queue.clone()
    }

    fn build_insert(&self, envelope: Envelope, policy: &TopicPolicy) -> Result<JobInsert> {
        let queue = self.select_queue(&envelope, policy);
        let max_attempts = envelope
            .headers
            .max_attempts
            .filter(|n| *n > 0)
            .or(self.max_attempts);

        let mut metadata = BTreeMap::new();
        metadata.insert("topic".to_string(), envelope.topic.to_string());
        metadata.insert("event_id".to_string(), envelope.id.to_string());
        if let Some(key) = &envelope.headers.idempotency_key {
            metadata.insert("idempotency_key".to_string(), key.clone());
        }
        for (key, value) in &envelope.headers.properties {
            metadata.insert(format!("property.{key}"), value.clone());
        }

        let tags = vec!["gala".to_string(), envelope.topic.to_string()];
        let args = DispatchJobArgs::new(envelope).to_bytes()?;

        Ok(JobInsert {
            kind: DISPATCH_JOB_KIND.to_string(),
            args,
            queue,
            max_attempts,
            tags,
            metadata,
        })
    }
}

#[async_trait]
impl DurableDispatcher for QueueDispatcher {
    async fn dispatch_durable(&self, _ctx: &Context, envelope: Envelope, policy: &TopicPolicy) -> Result<()> {
        let event_id = envelope.id.clone();
        let job = self.build_insert(envelope, policy)?;
        let queue = job.queue.clone();

        let job_id = self
            .client
            .insert(job)
            .await
            .map_err(|source| GalaError::JobInsertFailed {
                queue: queue.clone(),
                source,
            })?;

        debug!(event_id = %event_id, job_id = %job_id, queue = %queue, "gala envelope enqueued");
        Ok(())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

// ============================================================================
// Work side
// ============================================================================

/// A job claimed by a worker.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub kind: String,
    pub queue: String,
    pub args: Vec<u8>,
    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// May succeed on a later attempt.
    Retryable,
    /// Will never succeed; discard immediately.
    NonRetryable,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Claim up to `limit` ready jobs from `queue`.
    async fn claim_ready(&self, queue: &str, worker_id: &str, limit: usize) -> anyhow::Result<Vec<ClaimedJob>>;

    async fn mark_succeeded(&self, job_id: Uuid) -> anyhow::Result<()>;

    /// Retryable failures go back to the queue while attempts remain.
    async fn mark_failed(&self, job_id: Uuid, error: &str, kind: FailureKind) -> anyhow::Result<()>;

    async fn heartbeat(&self, job_id: Uuid) -> anyhow::Result<()>;

    /// Jobs that are waiting or running.
    async fn outstanding(&self) -> anyhow::Result<usize>;
}

type RuntimeProvider = Arc<dyn Fn() -> Option<Runtime> + Send + Sync>;

/// Replays dispatch jobs through a runtime.
#[derive(Clone)]
pub struct DispatchWorker {
    provider: RuntimeProvider,
}

impl DispatchWorker {
    pub fn new(runtime: Runtime) -> Self {
        Self::with_provider(move || Some(runtime.clone()))
    }

    /// Resolve the runtime lazily, for workers built before the runtime.
    pub fn with_provider<F>(provider: F) -> Self
    where
        F: Fn() -> Option<Runtime> + Send + Sync + 'static,
    {
        Self {
            provider: Arc::new(provider),
        }
    }

    pub fn kind(&self) -> &'static str {
        DISPATCH_JOB_KIND
    }

    /// Decode the job's envelope and dispatch it. Delivery runs detached from
    /// `ctx` cancellation.
    pub async fn work(&self, ctx: &Context, job: &ClaimedJob) -> Result<()> {
        let runtime = (self.provider)().ok_or(GalaError::RuntimeProviderRequired)?;
        let args = DispatchJobArgs::from_bytes(&job.args)?;

        runtime.dispatch_envelope(&ctx.without_cancel(), args.envelope).await
    }
}

impl std::fmt::Debug for DispatchWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchWorker").finish_non_exhaustive()
    }
}

/// Whether a dispatch failure is worth retrying.
pub fn failure_kind(error: &GalaError) -> FailureKind {
    match error {
        GalaError::JobEnvelopeRequired
        | GalaError::EnvelopeDecodeFailed(_)
        | GalaError::TopicNotRegistered { .. }
        | GalaError::UnsupportedSchemaVersion { .. }
        | GalaError::PayloadDecodeFailed { .. }
        | GalaError::PayloadTypeMismatch { .. }
        | GalaError::ContextSnapshotRestoreFailed { .. } => FailureKind::NonRetryable,
        _ => FailureKind::Retryable,
    }
}

// ============================================================================
// In-process queue
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Available,
    Running,
    Completed,
    Discarded,
}

/// Snapshot of one job held by a [`MemoryJobQueue`].
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: Uuid,
    pub insert: JobInsert,
    pub state: JobState,
    pub attempt: u32,
    pub max_attempts: u32,
    pub errors: Vec<String>,
    pub heartbeats: usize,
    pub inserted_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
}

impl JobRecord {
    fn is_finished(&self) -> bool {
        matches!(self.state, JobState::Completed | JobState::Discarded)
    }
}

struct QueueState {
    jobs: HashMap<Uuid, JobRecord>,
    order: Vec<Uuid>,
    finished: VecDeque<Uuid>,
    history: usize,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            jobs: HashMap::new(),
            order: Vec::new(),
            finished: VecDeque::new(),
            history: DEFAULT_FINISHED_HISTORY,
        }
    }
}

impl QueueState {
    /// Record a job reaching a terminal state and evict the oldest terminal
    /// jobs beyond the history limit.
    fn finish(&mut self, job_id: Uuid) {
        self.finished.push_back(job_id);
        if self.finished.len() <= self.history {
            return;
        }

        while self.finished.len() > self.history {
            if let Some(evicted) = self.finished.pop_front() {
                self.jobs.remove(&evicted);
            }
        }
        let jobs = &self.jobs;
        self.order.retain(|id| jobs.contains_key(id));
    }
}

/// In-process [`JobClient`] + [`JobStore`]. Jobs are claimed in insert order
/// and failed retryable jobs become available again immediately. Only the
/// most recent [`DEFAULT_FINISHED_HISTORY`] terminal jobs are retained.
#[derive(Clone, Default)]
pub struct MemoryJobQueue {
    state: Arc<Mutex<QueueState>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` completed or discarded jobs.
    pub fn with_finished_history(self, limit: usize) -> Self {
        self.lock().history = limit;
        self
    }

    pub fn job(&self, id: Uuid) -> Option<JobRecord> {
        self.lock().jobs.get(&id).cloned()
    }

    /// Every job, in insert order.
    pub fn jobs(&self) -> Vec<JobRecord> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect()
    }

    pub fn jobs_in_state(&self, job_state: JobState) -> Vec<JobRecord> {
        self.jobs()
            .into_iter()
            .filter(|job| job.state == job_state)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_job<R>(&self, job_id: Uuid, f: impl FnOnce(&mut JobRecord) -> R) -> anyhow::Result<R> {
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow!("job {job_id} not found"))?;
        let was_finished = job.is_finished();
        let result = f(job);

        if !was_finished && job.is_finished() {
            state.finish(job_id);
        }
        Ok(result)
    }
}

#[async_trait]
impl JobClient for MemoryJobQueue {
    async fn insert(&self, job: JobInsert) -> anyhow::Result<Uuid> {
        let id = Uuid::now_v7();
        let max_attempts = job.max_attempts.filter(|n| *n > 0).unwrap_or(DEFAULT_MAX_ATTEMPTS);
        let record = JobRecord {
            id,
            insert: job,
            state: JobState::Available,
            attempt: 0,
            max_attempts,
            errors: Vec::new(),
            heartbeats: 0,
            inserted_at: Utc::now(),
            claimed_by: None,
        };

        let mut state = self.lock();
        state.jobs.insert(id, record);
        state.order.push(id);
        Ok(id)
    }
}

#[async_trait]
impl JobStore for MemoryJobQueue {
    async fn claim_ready(&self, queue: &str, worker_id: &str, limit: usize) -> anyhow::Result<Vec<ClaimedJob>> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let mut claimed = Vec::new();

        for id in &state.order {
            if claimed.len() >= limit {
                break;
            }
            let Some(job) = state.jobs.get_mut(id) else {
                continue;
            };
            if job.state != JobState::Available || job.insert.queue != queue {
                continue;
            }

            job.state = JobState::Running;
            job.attempt += 1;
            job.claimed_by = Some(worker_id.to_string());
            claimed.push(ClaimedJob {
                id: job.id,
                kind: job.insert.kind.clone(),
                queue: job.insert.queue.clone(),
                args: job.insert.args.clone(),
                attempt: job.attempt,
                max_attempts: job.max_attempts,
            });
        }

        Ok(claimed)
    }

    async fn mark_succeeded(&self, job_id: Uuid) -> anyhow::Result<()> {
        self.with_job(job_id, |job| {
            job.state = JobState::Completed;
            job.claimed_by = None;
        })
    }

    async fn mark_failed(&self, job_id: Uuid, error: &str, kind: FailureKind) -> anyhow::Result<()> {
        self.with_job(job_id, |job| {
            job.errors.push(error.to_string());
            job.claimed_by = None;
            job.state = match kind {
                FailureKind::Retryable if job.attempt < job.max_attempts => JobState::Available,
                _ => JobState::Discarded,
            };
        })
    }

    async fn heartbeat(&self, job_id: Uuid) -> anyhow::Result<()> {
        self.with_job(job_id, |job| job.heartbeats += 1)
    }

    async fn outstanding(&self) -> anyhow::Result<usize> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|job| matches!(job.state, JobState::Available | JobState::Running))
            .count())
    }
}

impl std::fmt::Debug for MemoryJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryJobQueue").field("jobs", &self.len()).finish()
    }
}
