//! The wildcard event bus.
//!
//! Delivery for one emission:
//!
//! ```text
//! emit(topic, payload)
//!     │
//!     ├─► prepare: normalize + validate topic, attach client, assign event_id
//!     ├─► store.save_event (if configured)
//!     ├─► queue configured? ──► enqueue and stop, the queue consumer dispatches later
//!     │
//!     └─► for each matching pattern, most specific first
//!             └─► for each listener, highest priority first
//!                     ├─► skip if the deduper says it already succeeded
//!                     ├─► run with retries + backoff, panics caught per call
//!                     └─► error handler may forgive the failure
//!                 stop early once the event is aborted
//! ```
//!
//! Every listener error is collected; nothing short-circuits delivery except
//! the event's `aborted` flag.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::backoff::{self, BackoffFactory};
use crate::error::{Result, SoireeError};
use crate::event::{Client, Event, PROPERTY_EVENT_ID};
use crate::pattern::{
    compare_topic_specificity, match_topic_pattern, normalize_topic_name, validate_topic_name,
};
use crate::pool::{panic_message, Pool};
use crate::registry::{BusRegistry, RegistryHandle};
use crate::store::{EventQueue, EventStore, HandlerResultDeduper};
use crate::topic::{Listener, ListenerOptions, Priority, TopicListeners};

const DEFAULT_ERROR_BUFFER: usize = 10;

static NEXT_BUS_ID: AtomicU64 = AtomicU64::new(1);

/// Receives every listener failure; returning `None` forgives it.
pub type ErrorHandler = Arc<dyn Fn(&Event, SoireeError) -> Option<SoireeError> + Send + Sync>;

/// Receives every recovered listener panic: event, listener id, panic message.
pub type PanicHandler = Arc<dyn Fn(&Event, &str, &str) + Send + Sync>;

/// Generates listener ids and event ids.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// What an emit call publishes: a bare payload or a prepared event.
pub enum Emission {
    Payload(Value),
    Event(Event),
}

impl From<Value> for Emission {
    fn from(value: Value) -> Self {
        Emission::Payload(value)
    }
}

impl From<Event> for Emission {
    fn from(event: Event) -> Self {
        Emission::Event(event)
    }
}

/// A listener plus where and how to subscribe it.
pub struct ListenerBinding {
    pub topic: String,
    pub listener: Listener,
    pub options: ListenerOptions,
}

impl ListenerBinding {
    pub fn new(topic: impl Into<String>, listener: Listener) -> Self {
        Self {
            topic: topic.into(),
            listener,
            options: ListenerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ListenerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn register(self, bus: &EventBus) -> Result<String> {
        bus.on_with(&self.topic, self.listener, self.options)
    }
}

/// Wildcard pub/sub bus. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

pub(crate) struct BusInner {
    id: u64,
    topics: DashMap<String, Arc<TopicListeners>>,
    error_handler: ErrorHandler,
    panic_handler: PanicHandler,
    id_generator: IdGenerator,
    pool: Pool,
    closed: AtomicBool,
    error_buffer: usize,
    client: Option<Client>,
    store: Option<Arc<dyn EventStore>>,
    queue: Option<Arc<dyn EventQueue>>,
    deduper: Option<Arc<dyn HandlerResultDeduper>>,
    queue_cancel: CancellationToken,
    max_retries: usize,
    backoff: BackoffFactory,
    registry: Option<RegistryHandle>,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        self.queue_cancel.cancel();
        if let Some(registry) = &self.registry {
            registry.deregister(self.id);
        }
    }
}

impl EventBus {
    /// A bus with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::default()
    }

    pub(crate) fn from_inner(inner: Arc<BusInner>) -> Self {
        Self { inner }
    }

    /// The client handle attached to emitted events, downcast to `T`.
    pub fn client<T: std::any::Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner.client.clone().and_then(|c| c.downcast::<T>().ok())
    }

    pub fn pool(&self) -> &Pool {
        &self.inner.pool
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    // ===== Subscriptions =====

    /// Subscribe at normal priority. Returns the listener id.
    pub fn on(&self, topic: &str, listener: Listener) -> Result<String> {
        self.on_with(topic, listener, ListenerOptions::default())
    }

    pub fn on_with_priority(&self, topic: &str, listener: Listener, priority: Priority) -> Result<String> {
        self.on_with(topic, listener, ListenerOptions::default().priority(priority))
    }

    pub fn on_with(&self, topic: &str, listener: Listener, options: ListenerOptions) -> Result<String> {
        let topic = normalize_topic_name(topic);
        validate_topic_name(&topic)?;

        let id = (self.inner.id_generator)();
        let listener = options.wrap(listener);

        self.inner
            .topics
            .entry(topic.clone())
            .or_default()
            .add(id.clone(), options.priority, listener);

        debug!(%topic, listener_id = %id, priority = ?options.priority, "listener subscribed");
        Ok(id)
    }

    /// Register several bindings, stopping at the first failure.
    pub fn register_listeners(&self, bindings: Vec<ListenerBinding>) -> Result<Vec<String>> {
        bindings.into_iter().map(|b| b.register(self)).collect()
    }

    pub fn off(&self, topic: &str, listener_id: &str) -> Result<()> {
        let topic = normalize_topic_name(topic);
        validate_topic_name(&topic)?;

        let listeners = self
            .inner
            .topics
            .get(&topic)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SoireeError::TopicNotFound {
                topic: topic.clone(),
            })?;

        listeners.remove(&topic, listener_id)
    }

    /// Whether any listener would receive an emission on `topic`.
    pub fn interested_in(&self, topic: &str) -> bool {
        let topic = normalize_topic_name(topic);
        if validate_topic_name(&topic).is_err() {
            return false;
        }

        self.inner
            .topics
            .iter()
            .any(|entry| match_topic_pattern(entry.key(), &topic) && entry.value().has_listeners())
    }

    /// Subscribed patterns, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.topics.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.inner.topics.contains_key(&normalize_topic_name(topic))
    }

    // ===== Emission =====

    /// Publish asynchronously through the pool.
    ///
    /// The returned channel yields each unforgiven listener error and closes
    /// once delivery finishes. Errors beyond the channel buffer are dropped
    /// when nobody is reading. Must be called from within a tokio runtime.
    pub fn emit(&self, topic: &str, payload: impl Into<Emission>) -> mpsc::Receiver<SoireeError> {
        self.emit_inner(topic, payload.into(), None)
    }

    /// Like [`EventBus::emit`], with a cancellation token listeners can observe.
    pub fn emit_with_cancellation(
        &self,
        cancellation: CancellationToken,
        topic: &str,
        payload: impl Into<Emission>,
    ) -> mpsc::Receiver<SoireeError> {
        self.emit_inner(topic, payload.into(), Some(cancellation))
    }

    fn emit_inner(
        &self,
        topic: &str,
        emission: Emission,
        cancellation: Option<CancellationToken>,
    ) -> mpsc::Receiver<SoireeError> {
        let (tx, rx) = mpsc::channel(self.inner.error_buffer);

        if self.is_closed() {
            let _ = tx.try_send(SoireeError::EmitterClosed);
            return rx;
        }

        let (topic, mut event) = match self.prepare(topic, emission) {
            Ok(prepared) => prepared,
            Err(e) => {
                let _ = tx.try_send(e);
                return rx;
            }
        };
        if let Some(token) = cancellation {
            event = event.with_cancellation(token);
        }

        let bus = self.clone();
        let fallback = tx.clone();
        let accepted = self.inner.pool.submit(async move {
            let mut sink = |err: SoireeError| {
                let _ = tx.try_send(err);
            };

            if !bus.persist(&event, &mut sink).await {
                return;
            }
            bus.handle_events(&topic, &event, &mut sink).await;
        });

        if !accepted {
            let _ = fallback.try_send(SoireeError::EmitterClosed);
        }

        rx
    }

    /// Publish and wait for every matched listener to finish.
    pub async fn emit_sync(&self, topic: &str, payload: impl Into<Emission>) -> Vec<SoireeError> {
        if self.is_closed() {
            return vec![SoireeError::EmitterClosed];
        }

        let (topic, event) = match self.prepare(topic, payload.into()) {
            Ok(prepared) => prepared,
            Err(e) => return vec![e],
        };

        let mut errors = Vec::new();
        let mut sink = |err: SoireeError| errors.push(err);

        if self.persist(&event, &mut sink).await {
            self.handle_events(&topic, &event, &mut sink).await;
        }

        errors
    }

    /// Wait until the pool has no queued or running deliveries.
    pub async fn wait_for_idle(&self) {
        self.inner.pool.wait_idle().await;
    }

    /// Stop accepting emissions, drop every subscription and release the pool.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(SoireeError::EmitterAlreadyClosed);
        }

        self.inner.queue_cancel.cancel();
        self.inner.topics.clear();
        self.inner.pool.release();

        if let Some(registry) = &self.inner.registry {
            registry.deregister(self.inner.id);
        }

        debug!(bus_id = self.inner.id, "event bus closed");
        Ok(())
    }

    // ===== Delivery =====

    /// Save the event when a store is configured and enqueue it when a queue
    /// is. Returns whether local delivery should proceed.
    async fn persist(&self, event: &Event, sink: &mut (dyn FnMut(SoireeError) + Send)) -> bool {
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.save_event(event).await {
                warn!(topic = event.topic(), error = %e, "failed to save event");
                sink(SoireeError::Store(e));
            }
        }

        let Some(queue) = &self.inner.queue else {
            return true;
        };
        if let Err(e) = queue.enqueue_event(event).await {
            warn!(topic = event.topic(), error = %e, "failed to enqueue event");
            sink(SoireeError::Store(e));
        }
        false
    }

    fn prepare(&self, topic: &str, emission: Emission) -> Result<(String, Event)> {
        let topic = normalize_topic_name(topic);

        let mut event = match emission {
            Emission::Event(event) => {
                let event_topic = normalize_topic_name(event.topic());

                let name = match (topic.is_empty(), event_topic.is_empty()) {
                    (true, true) => {
                        return Err(SoireeError::InvalidTopicName {
                            name: String::new(),
                        })
                    }
                    (false, false) if topic != event_topic => {
                        return Err(SoireeError::EventTopicMismatch {
                            emit_topic: topic,
                            event_topic: event.topic().to_string(),
                        })
                    }
                    (true, false) => event_topic,
                    _ => topic,
                };
                validate_topic_name(&name)?;

                if event.topic() != name {
                    event.retarget(&name)
                } else {
                    event
                }
            }
            Emission::Payload(payload) => {
                validate_topic_name(&topic)?;
                Event::new(topic, payload)
            }
        };

        if let Some(client) = &self.inner.client {
            if !event.has_client() {
                event.set_client(client.clone());
            }
        }

        if event.event_id().is_none() {
            event.set_property(PROPERTY_EVENT_ID, (self.inner.id_generator)());
        }

        Ok((event.topic().to_string(), event))
    }

    async fn handle_events(
        &self,
        topic: &str,
        event: &Event,
        sink: &mut (dyn FnMut(SoireeError) + Send),
    ) {
        let mut matches: Vec<(String, Arc<TopicListeners>)> = self
            .inner
            .topics
            .iter()
            .filter(|entry| match_topic_pattern(entry.key(), topic))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        matches.sort_by(|a, b| compare_topic_specificity(&a.0, &b.0));

        for (_, listeners) in matches {
            for (id, listener) in listeners.snapshot() {
                if let Some(err) = self.run_listener_with_retry(event, &id, &listener).await {
                    if let Some(err) = (self.inner.error_handler)(event, err) {
                        sink(err);
                    }
                }

                if event.is_aborted() {
                    break;
                }
            }

            if event.is_aborted() {
                debug!(topic, event_id = ?event.event_id(), "event aborted");
                break;
            }
        }
    }

    async fn run_listener_with_retry(
        &self,
        event: &Event,
        id: &str,
        listener: &Listener,
    ) -> Option<SoireeError> {
        if let (Some(event_id), Some(deduper)) = (event.event_id(), &self.inner.deduper) {
            match deduper.handler_succeeded(event_id, id).await {
                Ok(true) => {
                    debug!(event_id, listener_id = id, "listener already succeeded, skipping");
                    return None;
                }
                Ok(false) => {}
                Err(e) => return Some(SoireeError::Store(e)),
            }
        }

        let attempts = self.inner.max_retries.max(1);
        let mut backoff = (self.inner.backoff)();
        let mut last_error = None;

        for attempt in 1..=attempts {
            let outcome = self.invoke(event, id, listener).await;

            if let Some(store) = &self.inner.store {
                let message = outcome.as_ref().err().map(ToString::to_string);
                if let Err(e) = store.save_handler_result(event, id, message.as_deref()).await {
                    warn!(handler_id = id, error = %e, "failed to save handler result");
                }
            }

            match outcome {
                Ok(()) => return None,
                Err(e) => last_error = Some(e),
            }

            if attempt == attempts {
                break;
            }
            let Some(wait) = backoff.next_backoff() else {
                break;
            };

            debug!(listener_id = id, attempt, ?wait, "retrying listener");
            tokio::time::sleep(wait).await;
        }

        last_error
    }

    async fn invoke(&self, event: &Event, id: &str, listener: &Listener) -> Result<()> {
        let call = AssertUnwindSafe(async { listener(event.clone()).await });

        match call.catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(SoireeError::Listener {
                listener_id: id.to_string(),
                source,
            }),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                (self.inner.panic_handler)(event, id, &message);
                Err(SoireeError::ListenerPanicked {
                    listener_id: id.to_string(),
                    message,
                })
            }
        }
    }

    fn start_queue_consumer(&self, queue: Arc<dyn EventQueue>) {
        let weak = Arc::downgrade(&self.inner);
        let cancel = self.inner.queue_cancel.clone();
        let backoff = self.inner.backoff.clone();

        tokio::spawn(consume_queue(weak, queue, cancel, backoff));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("id", &self.inner.id)
            .field("topics", &self.inner.topics.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn consume_queue(
    bus: Weak<BusInner>,
    queue: Arc<dyn EventQueue>,
    cancel: CancellationToken,
    backoff: BackoffFactory,
) {
    let mut backoff = backoff();

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let event = match queue.dequeue_event(&cancel).await {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(e) => {
                let wait = backoff.next_backoff().unwrap_or_else(|| {
                    backoff.reset();
                    backoff.next_backoff().unwrap_or_default()
                });
                error!(error = %e, ?wait, "failed to dequeue event");

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(wait) => continue,
                }
            }
        };
        backoff.reset();

        let Some(inner) = bus.upgrade() else {
            return;
        };
        let bus = EventBus::from_inner(inner);
        if bus.is_closed() {
            return;
        }

        let (topic, event) = match bus.prepare("", Emission::Event(event)) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(error = %e, "dropping queued event");
                continue;
            }
        };

        let mut sink = |err: SoireeError| {
            warn!(%topic, error = %err, "queued event listener failed");
        };
        bus.handle_events(&topic, &event, &mut sink).await;
    }
}

/// Builder for [`EventBus`].
pub struct EventBusBuilder {
    error_handler: Option<ErrorHandler>,
    panic_handler: Option<PanicHandler>,
    id_generator: Option<IdGenerator>,
    pool: Option<Pool>,
    error_buffer: usize,
    client: Option<Client>,
    store: Option<Arc<dyn EventStore>>,
    queue: Option<Arc<dyn EventQueue>>,
    deduper: Option<Arc<dyn HandlerResultDeduper>>,
    max_retries: usize,
    backoff: Option<BackoffFactory>,
    registry: Option<RegistryHandle>,
}

impl Default for EventBusBuilder {
    fn default() -> Self {
        Self {
            error_handler: None,
            panic_handler: None,
            id_generator: None,
            pool: None,
            error_buffer: DEFAULT_ERROR_BUFFER,
            client: None,
            store: None,
            queue: None,
            deduper: None,
            max_retries: 1,
            backoff: None,
            registry: None,
        }
    }
}

impl EventBusBuilder {
    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Event, SoireeError) -> Option<SoireeError> + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn panic_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Event, &str, &str) + Send + Sync + 'static,
    {
        self.panic_handler = Some(Arc::new(handler));
        self
    }

    pub fn id_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.id_generator = Some(Arc::new(generator));
        self
    }

    pub fn pool(mut self, pool: Pool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Capacity of each emit error channel.
    pub fn error_buffer(mut self, size: usize) -> Self {
        self.error_buffer = size.max(1);
        self
    }

    pub fn client<C: std::any::Any + Send + Sync>(mut self, client: C) -> Self {
        self.client = Some(Arc::new(client));
        self
    }

    /// Persist events and listener results without changing delivery.
    pub fn store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn deduper(mut self, deduper: Arc<dyn HandlerResultDeduper>) -> Self {
        self.deduper = Some(deduper);
        self
    }

    /// Route every emission through a durable queue drained by a background consumer.
    pub fn queue_store<S>(mut self, store: Arc<S>) -> Self
    where
        S: EventStore + EventQueue + HandlerResultDeduper,
    {
        self.store = Some(store.clone());
        self.queue = Some(store.clone());
        self.deduper = Some(store);
        self
    }

    /// Attempts per listener; values below 1 mean a single attempt.
    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn backoff(mut self, factory: BackoffFactory) -> Self {
        self.backoff = Some(factory);
        self
    }

    pub fn registry(mut self, registry: &BusRegistry) -> Self {
        self.registry = Some(registry.handle());
        self
    }

    /// Build the bus. With a queue store this spawns the consumer, so it
    /// must run inside a tokio runtime.
    pub fn build(self) -> EventBus {
        let id = NEXT_BUS_ID.fetch_add(1, Ordering::Relaxed);
        let queue = self.queue;

        let inner = Arc::new(BusInner {
            id,
            topics: DashMap::new(),
            error_handler: self
                .error_handler
                .unwrap_or_else(|| Arc::new(|_: &Event, err: SoireeError| Some(err))),
            panic_handler: self.panic_handler.unwrap_or_else(|| {
                Arc::new(|event: &Event, listener_id: &str, message: &str| {
                    error!(topic = event.topic(), listener_id, panic = message, "listener panicked");
                })
            }),
            id_generator: self
                .id_generator
                .unwrap_or_else(|| Arc::new(|| uuid::Uuid::new_v4().to_string())),
            pool: self.pool.unwrap_or_default(),
            closed: AtomicBool::new(false),
            error_buffer: self.error_buffer,
            client: self.client,
            store: self.store,
            queue: queue.clone(),
            deduper: self.deduper,
            queue_cancel: CancellationToken::new(),
            max_retries: self.max_retries,
            backoff: self.backoff.unwrap_or_else(backoff::exponential),
            registry: self.registry,
        });

        if let Some(registry) = &inner.registry {
            registry.register(id, Arc::downgrade(&inner));
        }

        let bus = EventBus { inner };
        if let Some(queue) = queue {
            bus.start_queue_consumer(queue);
        }

        bus
    }
}
