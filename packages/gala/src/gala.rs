//! Lifecycle façade tying the runtime to a dispatch mode.
//!
//! [`Gala`] is built from a [`GalaConfig`] and owns everything an application
//! needs at startup: the registry, context manager, injector, and either an
//! in-process worker pool or a job queue plus its workers.
//!
//! The façade's dispatch mode overrides each topic's emit mode:
//!
//! ```text
//! in_memory ─► EmitMode::Inline  ─► soiree::Pool ─► Runtime::dispatch_envelope
//! durable   ─► EmitMode::Durable ─► QueueDispatcher ─► JobClient
//!                                        JobWorker ◄─ JobStore
//! ```
//!
//! # Example
//!
//! ```ignore
//! let queue = MemoryJobQueue::new();
//! let gala = Gala::builder(GalaConfig::from_env()?)
//!     .job_queue(queue)
//!     .build()?;
//!
//! let member_created = Topic::<MemberCreated>::new("member.created");
//! Registration::json(member_created.clone()).register(gala.registry())?;
//! Definition::new(&member_created, "send_welcome")
//!     .handle(|ctx, member| async move { welcome(ctx, member).await })
//!     .attach(gala.registry())?;
//!
//! gala.start_workers()?;
//! let receipt = gala.emit_typed(&ctx, &member_created, &member, Headers::new()).await;
//! gala.wait_idle().await;
//! gala.close().await;
//! ```

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use soiree::Pool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DispatchMode, GalaConfig};
use crate::context::{Context, ContextManager};
use crate::envelope::{EmitReceipt, Envelope, Headers};
use crate::error::{GalaError, Result};
use crate::injector::Injector;
use crate::job::{DispatchWorker, JobClient, JobStore, MemoryJobQueue, QueueDispatcher};
use crate::registry::Registry;
use crate::runtime::Runtime;
use crate::topic::{EmitMode, QueueClass, Topic, TopicName, TopicPayload};
use crate::worker::{JobWorker, JobWorkerConfig};

const DURABLE_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const DURABLE_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DURABLE_IDLE_THRESHOLD: usize = 3;

struct RunningWorkers {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Gala {
    runtime: Runtime,
    dispatch_mode: DispatchMode,
    enabled: bool,
    worker_config: JobWorkerConfig,
    job_store: Option<Arc<dyn JobStore>>,
    pool: Option<Pool>,
    workers: Mutex<Option<RunningWorkers>>,
}

impl Gala {
    pub fn builder(config: GalaConfig) -> GalaBuilder {
        GalaBuilder::new(config)
    }

    pub fn registry(&self) -> &Registry {
        self.runtime.registry()
    }

    pub fn injector(&self) -> &Injector {
        self.runtime.injector()
    }

    pub fn context_manager(&self) -> &ContextManager {
        self.runtime.context_manager()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn dispatch_mode(&self) -> DispatchMode {
        self.dispatch_mode
    }

    fn emit_mode(&self) -> EmitMode {
        match self.dispatch_mode {
            DispatchMode::InMemory => EmitMode::Inline,
            DispatchMode::Durable => EmitMode::Durable,
        }
    }

    // ========================================================================
    // Emit
    // ========================================================================

    /// Emit a payload. Routing failures after the envelope is built come back
    /// as [`GalaError::DispatchFailed`].
    pub async fn emit_with_headers<P: Any + Send + Sync>(
        &self,
        ctx: &Context,
        topic: &TopicName,
        payload: &P,
        headers: Headers,
    ) -> EmitReceipt {
        let receipt = self
            .runtime
            .emit_with_mode(ctx, topic, payload, headers, self.emit_mode())
            .await;
        wrap_dispatch_failure(receipt)
    }

    pub async fn emit_typed<T: TopicPayload>(
        &self,
        ctx: &Context,
        topic: &Topic<T>,
        payload: &T,
        headers: Headers,
    ) -> EmitReceipt {
        self.emit_with_headers(ctx, topic.name(), payload, headers).await
    }

    /// Route a pre-built envelope, keeping its id.
    pub async fn emit_envelope(&self, ctx: &Context, envelope: Envelope) -> Result<()> {
        self.runtime
            .emit_envelope_with_mode(ctx, envelope, self.emit_mode())
            .await
    }

    /// Run listeners for one envelope in the calling task.
    pub async fn dispatch_envelope(&self, ctx: &Context, envelope: Envelope) -> Result<()> {
        self.runtime.dispatch_envelope(ctx, envelope).await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start polling the job queues. A no-op in memory mode, when disabled,
    /// or when workers are already running.
    pub fn start_workers(&self) -> Result<()> {
        if self.dispatch_mode == DispatchMode::InMemory || !self.enabled {
            return Ok(());
        }

        let store = self.job_store.clone().ok_or(GalaError::JobStoreRequired)?;

        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if workers.is_some() {
            debug!("gala workers already running");
            return Ok(());
        }

        let worker = JobWorker::with_config(
            store,
            DispatchWorker::new(self.runtime.clone()),
            self.worker_config.clone(),
        );
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                if let Err(e) = worker.run(shutdown).await {
                    error!(error = %e, "gala job worker exited with error");
                }
            }
        });

        info!(queues = ?self.worker_config.queues, "gala workers started");
        *workers = Some(RunningWorkers { shutdown, handle });
        Ok(())
    }

    /// Stop the job workers and wait for claimed jobs to finish.
    pub async fn stop_workers(&self) {
        let running = self.workers.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(running) = running else {
            return;
        };

        running.shutdown.cancel();
        if let Err(e) = running.handle.await {
            error!(error = %e, "gala job worker task failed");
        }
        info!("gala workers stopped");
    }

    /// Wait until dispatched work has drained.
    ///
    /// In memory mode this waits for the pool. In durable mode it polls the
    /// job store until it reports no outstanding jobs on three consecutive
    /// polls, giving up after 30 seconds.
    pub async fn wait_idle(&self) {
        match self.dispatch_mode {
            DispatchMode::InMemory => {
                if let Some(pool) = &self.pool {
                    pool.wait_idle().await;
                }
            }
            DispatchMode::Durable => {
                let Some(store) = &self.job_store else {
                    return;
                };
                if tokio::time::timeout(DURABLE_WAIT_TIMEOUT, wait_durable_idle(store.as_ref()))
                    .await
                    .is_err()
                {
                    warn!(timeout = ?DURABLE_WAIT_TIMEOUT, "gala durable queue did not go idle");
                }
            }
        }
    }

    /// Release the pool and stop workers. Emits after close fail with
    /// [`GalaError::DispatcherClosed`] in memory mode.
    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.release();
        }
        self.stop_workers().await;
    }
}

async fn wait_durable_idle(store: &dyn JobStore) {
    let mut idle_count = 0;

    while idle_count < DURABLE_IDLE_THRESHOLD {
        match store.outstanding().await {
            Ok(0) => idle_count += 1,
            Ok(_) => idle_count = 0,
            Err(e) => {
                debug!(error = %e, "failed to count outstanding jobs");
                idle_count = 0;
            }
        }
        tokio::time::sleep(DURABLE_WAIT_POLL_INTERVAL).await;
    }
}

fn wrap_dispatch_failure(mut receipt: EmitReceipt) -> EmitReceipt {
    receipt.error = match (receipt.event_id.clone(), receipt.error.take()) {
        (Some(event_id), Some(source)) => Some(GalaError::DispatchFailed {
            event_id,
            source: Box::new(source),
        }),
        (_, error) => error,
    };
    receipt
}

impl Drop for Gala {
    fn drop(&mut self) {
        let workers = self.workers.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(running) = workers.take() {
            running.shutdown.cancel();
        }
    }
}

impl std::fmt::Debug for Gala {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gala")
            .field("dispatch_mode", &self.dispatch_mode)
            .field("enabled", &self.enabled)
            .field("runtime", &self.runtime)
            .finish()
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct GalaBuilder {
    config: GalaConfig,
    job_client: Option<Arc<dyn JobClient>>,
    job_store: Option<Arc<dyn JobStore>>,
    queue_by_class: Vec<(QueueClass, String)>,
    registry: Option<Arc<Registry>>,
    context_manager: Option<Arc<ContextManager>>,
    injector: Option<Injector>,
}

impl GalaBuilder {
    pub fn new(config: GalaConfig) -> Self {
        Self {
            config,
            job_client: None,
            job_store: None,
            queue_by_class: Vec::new(),
            registry: None,
            context_manager: None,
            injector: None,
        }
    }

    pub fn job_client(mut self, client: Arc<dyn JobClient>) -> Self {
        self.job_client = Some(client);
        self
    }

    pub fn job_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.job_store = Some(store);
        self
    }

    /// Use one in-process queue as both job client and job store.
    pub fn job_queue(self, queue: MemoryJobQueue) -> Self {
        let queue = Arc::new(queue);
        self.job_client(queue.clone()).job_store(queue)
    }

    /// Route topics of `class` to `queue` unless an envelope names its own.
    pub fn queue_for(mut self, class: QueueClass, queue: impl Into<String>) -> Self {
        self.queue_by_class.push((class, queue.into()));
        self
    }

    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn context_manager(mut self, context_manager: Arc<ContextManager>) -> Self {
        self.context_manager = Some(context_manager);
        self
    }

    pub fn injector(mut self, injector: Injector) -> Self {
        self.injector = Some(injector);
        self
    }

    pub fn build(self) -> Result<Gala> {
        let mut config = self.config;
        config.normalize();

        let mut runtime = Runtime::builder()
            .registry(self.registry.unwrap_or_default())
            .context_manager(self.context_manager.unwrap_or_default())
            .injector(self.injector.unwrap_or_default());

        let mut pool = None;
        let mut job_store = None;

        match config.dispatch_mode {
            DispatchMode::InMemory => {
                let inline = Pool::builder()
                    .name("gala")
                    .max_workers(config.worker_count)
                    .build();
                runtime = runtime.inline_pool(inline.clone());
                pool = Some(inline);
            }
            DispatchMode::Durable => {
                let client = self.job_client.ok_or(GalaError::JobClientRequired)?;
                let store = self.job_store.ok_or(GalaError::JobStoreRequired)?;

                let mut dispatcher = QueueDispatcher::new(client, config.queue_name.clone());
                if let Some(max_attempts) = config.max_attempts() {
                    dispatcher = dispatcher.with_max_attempts(max_attempts);
                }
                for (class, queue) in self.queue_by_class {
                    dispatcher = dispatcher.with_queue_for(class, queue);
                }

                runtime = runtime.durable_dispatcher(dispatcher);
                job_store = Some(store);
            }
        }

        debug!(
            dispatch_mode = %config.dispatch_mode,
            queue = %config.queue_name,
            worker_count = config.worker_count,
            "gala initialized"
        );

        Ok(Gala {
            runtime: runtime.build(),
            dispatch_mode: config.dispatch_mode,
            enabled: config.enabled,
            worker_config: config.worker_config(),
            job_store,
            pool,
            workers: Mutex::new(None),
        })
    }
}
