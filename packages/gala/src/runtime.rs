//! Emit-side routing and worker-side dispatch.
//!
//! # Emit
//!
//! ```text
//! emit_with_headers(topic, payload)
//!     │
//!     ├─► encode payload (registry codec + wrap hook)
//!     ├─► capture context snapshot
//!     ├─► build Envelope
//!     └─► route by EmitMode
//!             ├─ Inline  ─► dispatch_envelope (or the inline pool)
//!             ├─ Durable ─► DurableDispatcher::dispatch_durable
//!             └─ Dual    ─► both, errors joined
//! ```
//!
//! # Dispatch
//!
//! `dispatch_envelope` decodes the payload, restores context, and runs every
//! listener whose operation filter accepts the payload, in registration order.
//! Dispatch is fail-fast: the first listener error or panic stops the
//! remaining listeners and is returned. Callers that need isolation between
//! listeners should split them across topics.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use soiree::{panic_message, Pool};
use tracing::{debug, error, warn};

use crate::context::{Context, ContextManager};
use crate::dispatch::DurableDispatcher;
use crate::envelope::{EmitReceipt, Envelope, Headers};
use crate::error::{GalaError, ListenerError, Result};
use crate::injector::{HandlerContext, Injector};
use crate::registry::{DecodedPayload, RegisteredListener, Registry};
use crate::topic::{EmitMode, Topic, TopicName, TopicPayload, TopicPolicy};

#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    registry: Arc<Registry>,
    context_manager: Arc<ContextManager>,
    injector: Injector,
    durable: Option<Arc<dyn DurableDispatcher>>,
    inline_pool: Option<Pool>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn context_manager(&self) -> &ContextManager {
        &self.inner.context_manager
    }

    pub fn injector(&self) -> &Injector {
        &self.inner.injector
    }

    pub fn has_durable_dispatcher(&self) -> bool {
        self.inner.durable.is_some()
    }

    pub fn inline_pool(&self) -> Option<&Pool> {
        self.inner.inline_pool.as_ref()
    }

    // ========================================================================
    // Emit
    // ========================================================================

    /// Emit a typed payload using the topic's registered policy.
    pub async fn emit_typed<T: TopicPayload>(
        &self,
        ctx: &Context,
        topic: &Topic<T>,
        payload: &T,
        headers: Headers,
    ) -> EmitReceipt {
        self.emit_with_headers(ctx, topic.name(), payload, headers).await
    }

    /// Emit using the topic's registered policy.
    pub async fn emit_with_headers<P: Any + Send + Sync>(
        &self,
        ctx: &Context,
        topic: &TopicName,
        payload: &P,
        headers: Headers,
    ) -> EmitReceipt {
        let prepared = self.prepare(ctx, topic, payload, headers);
        self.route_prepared(ctx, prepared, None).await
    }

    /// Emit with an explicit mode, ignoring the topic's registered mode.
    pub async fn emit_with_mode<P: Any + Send + Sync>(
        &self,
        ctx: &Context,
        topic: &TopicName,
        payload: &P,
        headers: Headers,
        mode: EmitMode,
    ) -> EmitReceipt {
        let prepared = self.prepare(ctx, topic, payload, headers);
        self.route_prepared(ctx, prepared, Some(mode)).await
    }

    /// Route a pre-built envelope. Its id is kept; an empty snapshot is
    /// replaced by one captured from `ctx`.
    pub async fn emit_envelope(&self, ctx: &Context, envelope: Envelope) -> Result<()> {
        let (envelope, policy) = self.adopt_envelope(ctx, envelope)?;
        self.route(ctx, envelope, policy.emit_mode, &policy).await
    }

    pub(crate) async fn emit_envelope_with_mode(
        &self,
        ctx: &Context,
        envelope: Envelope,
        mode: EmitMode,
    ) -> Result<()> {
        let (envelope, policy) = self.adopt_envelope(ctx, envelope)?;
        self.route(ctx, envelope, mode, &policy).await
    }

    fn adopt_envelope(&self, ctx: &Context, mut envelope: Envelope) -> Result<(Envelope, TopicPolicy)> {
        let entry = self.inner.registry.resolve(&envelope.topic)?;

        if envelope.schema_version == 0 {
            envelope.schema_version = entry.schema_version;
        }
        if envelope.context_snapshot.is_empty() {
            envelope.context_snapshot = self.inner.context_manager.capture(ctx)?;
        }

        Ok((envelope, entry.policy))
    }

    fn prepare(
        &self,
        ctx: &Context,
        topic: &TopicName,
        payload: &dyn Any,
        headers: Headers,
    ) -> Result<(Envelope, TopicPolicy)> {
        let entry = self.inner.registry.resolve(topic)?;
        let bytes = entry.encode(payload)?;
        let snapshot = self.inner.context_manager.capture(ctx)?;

        let envelope = Envelope::new(entry.name.clone(), bytes)
            .with_schema_version(entry.schema_version)
            .with_headers(headers)
            .with_context_snapshot(snapshot);

        Ok((envelope, entry.policy))
    }

    async fn route_prepared(
        &self,
        ctx: &Context,
        prepared: Result<(Envelope, TopicPolicy)>,
        mode: Option<EmitMode>,
    ) -> EmitReceipt {
        let (envelope, policy) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return EmitReceipt::rejected(None, e),
        };

        let event_id = envelope.id.clone();
        let topic = envelope.topic.clone();
        let mode = mode.unwrap_or(policy.emit_mode);

        match self.route(ctx, envelope, mode, &policy).await {
            Ok(()) => {
                debug!(event_id = %event_id, topic = %topic, mode = %mode, "gala event emitted");
                EmitReceipt::accepted(event_id)
            }
            Err(e) => {
                debug!(event_id = %event_id, topic = %topic, mode = %mode, error = %e, "gala event dispatch failed");
                EmitReceipt::rejected(Some(event_id), e)
            }
        }
    }

    async fn route(&self, ctx: &Context, envelope: Envelope, mode: EmitMode, policy: &TopicPolicy) -> Result<()> {
        match mode {
            EmitMode::Inline => self.dispatch_inline(ctx, envelope).await,
            EmitMode::Durable => self.dispatch_durable(ctx, envelope, policy).await,
            EmitMode::Dual => {
                let durable = self.dispatch_durable(ctx, envelope.clone(), policy).await;
                let inline = self.dispatch_inline(ctx, envelope).await;

                match GalaError::join(durable.err().into_iter().chain(inline.err())) {
                    Some(joined) => Err(joined),
                    None => Ok(()),
                }
            }
        }
    }

    async fn dispatch_durable(&self, ctx: &Context, envelope: Envelope, policy: &TopicPolicy) -> Result<()> {
        let Some(dispatcher) = &self.inner.durable else {
            return Err(GalaError::DurableDispatcherRequired {
                topic: envelope.topic,
            });
        };
        dispatcher.dispatch_durable(ctx, envelope, policy).await
    }

    async fn dispatch_inline(&self, ctx: &Context, envelope: Envelope) -> Result<()> {
        let Some(pool) = &self.inner.inline_pool else {
            return self.dispatch_envelope(ctx, envelope).await;
        };

        let runtime = self.clone();
        let ctx = ctx.without_cancel();
        let accepted = pool.submit(async move {
            let event_id = envelope.id.clone();
            let topic = envelope.topic.clone();
            if let Err(e) = runtime.dispatch_envelope(&ctx, envelope).await {
                warn!(event_id = %event_id, topic = %topic, error = %e, "gala in-memory dispatch failed");
            }
        });

        if accepted {
            Ok(())
        } else {
            Err(GalaError::DispatcherClosed)
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Deliver one envelope to every interested listener on its topic.
    pub async fn dispatch_envelope(&self, ctx: &Context, envelope: Envelope) -> Result<()> {
        let entry = self.inner.registry.resolve(&envelope.topic)?;

        if envelope.schema_version > entry.schema_version {
            return Err(GalaError::UnsupportedSchemaVersion {
                topic: envelope.topic,
                version: envelope.schema_version,
                supported: entry.schema_version,
            });
        }

        let payload = entry.decode(&envelope.payload)?;
        let context = self
            .inner
            .context_manager
            .restore(ctx, &envelope.context_snapshot)?;
        let operation = entry.operation(payload.as_ref());
        let op = operation.as_deref().unwrap_or_default();

        debug!(event_id = %envelope.id, topic = %envelope.topic, operation = op, "gala processing event");

        let handler_context = HandlerContext {
            context,
            envelope: Arc::new(envelope),
            injector: self.inner.injector.clone(),
        };
        let event_id = &handler_context.envelope.id;
        let topic = &handler_context.envelope.topic;

        let mut invoked = 0usize;
        for listener in &entry.listeners {
            if !listener.accepts(operation.as_deref()) {
                continue;
            }
            invoked += 1;

            if let Err(e) = execute_listener(&handler_context, listener, payload.clone()).await {
                warn!(
                    event_id = %event_id,
                    topic = %topic,
                    operation = op,
                    listener = listener.name(),
                    error = %e,
                    "gala listener failed"
                );
                return Err(e.into());
            }
        }

        debug!(
            event_id = %event_id,
            topic = %topic,
            operation = op,
            listener_count = invoked,
            "gala event processed"
        );
        Ok(())
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("topics", &self.inner.registry.topics())
            .field("durable", &self.inner.durable.is_some())
            .field("inline_pool", &self.inner.inline_pool)
            .finish()
    }
}

/// Run one listener, converting a panic into a [`ListenerError`].
async fn execute_listener(
    ctx: &HandlerContext,
    listener: &RegisteredListener,
    payload: DecodedPayload,
) -> std::result::Result<(), ListenerError> {
    let call = (listener.handle)(ctx.clone(), payload);

    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(cause)) => Err(ListenerError::failed(listener.name(), cause)),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(
                event_id = %ctx.envelope.id,
                listener = listener.name(),
                panic = %message,
                "gala listener panicked"
            );
            Err(ListenerError::panicked(listener.name(), message))
        }
    }
}

#[derive(Default)]
pub struct RuntimeBuilder {
    registry: Option<Arc<Registry>>,
    context_manager: Option<Arc<ContextManager>>,
    injector: Option<Injector>,
    durable: Option<Arc<dyn DurableDispatcher>>,
    inline_pool: Option<Pool>,
}

impl RuntimeBuilder {
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

    pub fn durable_dispatcher(self, dispatcher: impl DurableDispatcher + 'static) -> Self {
        self.durable_dispatcher_arc(Arc::new(dispatcher))
    }

    pub fn durable_dispatcher_arc(mut self, dispatcher: Arc<dyn DurableDispatcher>) -> Self {
        self.durable = Some(dispatcher);
        self
    }

    /// Run inline dispatch on a bounded pool. Emit then returns once the
    /// envelope is queued on the pool rather than after listeners finish.
    pub fn inline_pool(mut self, pool: Pool) -> Self {
        self.inline_pool = Some(pool);
        self
    }

    pub fn build(self) -> Runtime {
        Runtime {
            inner: Arc::new(RuntimeInner {
                registry: self.registry.unwrap_or_default(),
                context_manager: self.context_manager.unwrap_or_default(),
                injector: self.injector.unwrap_or_default(),
                durable: self.durable,
                inline_pool: self.inline_pool,
            }),
        }
    }
}
