//! Topic and listener registry.
//!
//! Registration is generic; storage is not. Each topic keeps one pair of
//! type-erased encode/decode closures that capture its [`Codec`], and each
//! listener keeps a type-erased handler that downcasts the decoded payload
//! back to `T` before calling user code.
//!
//! ```text
//! Registration<T> ──► TopicEntry { encode, decode, operation, listeners }
//! Definition<T>   ──► RegisteredListener { name, operations, handle }
//! ```
//!
//! Topics must be registered before listeners attach. Reads hand out cloned
//! entries so dispatch never holds the lock while running listeners.
//!
//! # Example
//!
//! ```ignore
//! let topic = Topic::<MemberCreated>::new("member.created");
//! Registration::json(topic.clone())
//!     .emit_mode(EmitMode::Durable)
//!     .register(&registry)?;
//!
//! Definition::new(&topic, "welcome_email")
//!     .operations(["create"])
//!     .handle(|ctx, payload: MemberCreated| async move {
//!         let mailer = ctx.resolve::<Mailer>()?;
//!         mailer.welcome(&payload.email).await
//!     })
//!     .attach(&registry)?;
//! ```

use std::any::{type_name, Any};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::codec::{Codec, JsonCodec};
use crate::error::{GalaError, Result};
use crate::injector::HandlerContext;
use crate::topic::{EmitMode, QueueClass, Topic, TopicName, TopicPayload, TopicPolicy};

/// Payload after decoding, shared read-only between listeners.
pub type DecodedPayload = Arc<dyn Any + Send + Sync>;

type EncodeFn = Arc<dyn Fn(&dyn Any) -> Result<Vec<u8>> + Send + Sync>;
type DecodeFn = Arc<dyn Fn(&[u8]) -> Result<DecodedPayload> + Send + Sync>;
type OperationFn = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Option<String> + Send + Sync>;
pub(crate) type ErasedHandler =
    Arc<dyn Fn(HandlerContext, DecodedPayload) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type TypedHandler<T> = Arc<dyn Fn(HandlerContext, T) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

// ============================================================================
// Entries
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A listener attached to a topic.
#[derive(Clone)]
pub struct RegisteredListener {
    id: ListenerId,
    name: String,
    operations: BTreeSet<String>,
    pub(crate) handle: ErasedHandler,
}

impl RegisteredListener {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operations(&self) -> &BTreeSet<String> {
        &self.operations
    }

    /// Empty filter accepts everything; otherwise the operation must be listed.
    pub fn accepts(&self, operation: Option<&str>) -> bool {
        if self.operations.is_empty() {
            return true;
        }
        operation.is_some_and(|op| self.operations.contains(op))
    }
}

impl fmt::Debug for RegisteredListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredListener")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("operations", &self.operations)
            .finish()
    }
}

/// Everything the runtime needs to dispatch one topic.
#[derive(Clone)]
pub(crate) struct TopicEntry {
    pub(crate) name: TopicName,
    pub(crate) schema_version: u32,
    pub(crate) policy: TopicPolicy,
    encode: EncodeFn,
    decode: DecodeFn,
    operation: OperationFn,
    pub(crate) listeners: Vec<RegisteredListener>,
}

impl TopicEntry {
    pub(crate) fn encode(&self, payload: &dyn Any) -> Result<Vec<u8>> {
        (self.encode)(payload)
    }

    pub(crate) fn decode(&self, bytes: &[u8]) -> Result<DecodedPayload> {
        (self.decode)(bytes)
    }

    pub(crate) fn operation(&self, payload: &(dyn Any + Send + Sync)) -> Option<String> {
        (self.operation)(payload)
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
pub struct Registry {
    topics: RwLock<HashMap<TopicName, TopicEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_topic<T: TopicPayload>(&self, registration: Registration<T>) -> Result<()> {
        let Registration {
            topic,
            codec,
            policy,
        } = registration;

        let name = topic.name().clone();
        if name.is_blank() {
            return Err(GalaError::TopicNameRequired);
        }
        let codec = codec.ok_or_else(|| GalaError::CodecRequired {
            topic: name.clone(),
        })?;

        let mut topics = self.write();
        if topics.contains_key(&name) {
            return Err(GalaError::TopicAlreadyRegistered { topic: name });
        }

        let entry = erase_topic(&topic, codec, policy);
        topics.insert(name, entry);
        Ok(())
    }

    pub fn attach_listener<T: TopicPayload>(&self, definition: Definition<T>) -> Result<ListenerId> {
        let Definition {
            topic,
            name,
            operations,
            handler,
        } = definition;

        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(GalaError::ListenerNameRequired { topic });
        }
        let handler = handler.ok_or_else(|| GalaError::ListenerHandlerRequired {
            listener: name.clone(),
        })?;

        let mut topics = self.write();
        let Some(entry) = topics.get_mut(&topic) else {
            return Err(GalaError::ListenerTopicNotRegistered {
                topic,
                listener: name,
            });
        };

        let listener = RegisteredListener {
            id: ListenerId::new(),
            name,
            operations,
            handle: erase_handler(topic, handler),
        };
        let id = listener.id;
        entry.listeners.push(listener);
        Ok(id)
    }

    /// Attach each definition in order, stopping at the first failure.
    pub fn register_listeners<T, I>(&self, definitions: I) -> Result<Vec<ListenerId>>
    where
        T: TopicPayload,
        I: IntoIterator<Item = Definition<T>>,
    {
        definitions
            .into_iter()
            .map(|definition| self.attach_listener(definition))
            .collect()
    }

    pub fn encode_payload(&self, topic: &TopicName, payload: &dyn Any) -> Result<Vec<u8>> {
        self.resolve(topic)?.encode(payload)
    }

    pub fn decode_payload(&self, topic: &TopicName, bytes: &[u8]) -> Result<DecodedPayload> {
        self.resolve(topic)?.decode(bytes)
    }

    /// Copy of the topic's listeners, in registration order.
    pub fn listeners(&self, topic: &TopicName) -> Vec<RegisteredListener> {
        self.read()
            .get(topic)
            .map(|entry| entry.listeners.clone())
            .unwrap_or_default()
    }

    pub fn topic_policy(&self, topic: &TopicName) -> Result<TopicPolicy> {
        self.resolve(topic).map(|entry| entry.policy)
    }

    pub fn schema_version(&self, topic: &TopicName) -> Result<u32> {
        self.resolve(topic).map(|entry| entry.schema_version)
    }

    /// True when some listener on `topic` accepts `operation`.
    pub fn interested_in(&self, topic: &TopicName, operation: Option<&str>) -> bool {
        self.read()
            .get(topic)
            .is_some_and(|entry| entry.listeners.iter().any(|l| l.accepts(operation)))
    }

    pub fn is_registered(&self, topic: &TopicName) -> bool {
        self.read().contains_key(topic)
    }

    /// Registered topic names, sorted.
    pub fn topics(&self) -> Vec<TopicName> {
        let mut names: Vec<_> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn resolve(&self, topic: &TopicName) -> Result<TopicEntry> {
        self.read()
            .get(topic)
            .cloned()
            .ok_or_else(|| GalaError::TopicNotRegistered {
                topic: topic.clone(),
            })
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TopicName, TopicEntry>> {
        self.topics.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TopicName, TopicEntry>> {
        self.topics.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("topics", &self.topics())
            .finish()
    }
}

fn erase_topic<T: TopicPayload>(topic: &Topic<T>, codec: Arc<dyn Codec<T>>, policy: TopicPolicy) -> TopicEntry {
    let name = topic.name().clone();
    let (wrap, unwrap) = topic.hooks();

    let encode: EncodeFn = {
        let codec = codec.clone();
        let name = name.clone();
        Arc::new(move |payload: &dyn Any| {
            let value = payload
                .downcast_ref::<T>()
                .ok_or_else(|| GalaError::PayloadTypeMismatch {
                    topic: name.clone(),
                    expected: type_name::<T>(),
                })?;
            let encode_failed = |source| GalaError::PayloadEncodeFailed {
                topic: name.clone(),
                source,
            };
            let bytes = codec.encode(value).map_err(encode_failed)?;
            match &wrap {
                Some(wrap) => wrap(bytes).map_err(encode_failed),
                None => Ok(bytes),
            }
        })
    };

    let decode: DecodeFn = {
        let name = name.clone();
        Arc::new(move |bytes: &[u8]| {
            let decode_failed = |source| GalaError::PayloadDecodeFailed {
                topic: name.clone(),
                source,
            };
            let value = match &unwrap {
                Some(unwrap) => codec.decode(&unwrap(bytes.to_vec()).map_err(decode_failed)?),
                None => codec.decode(bytes),
            }
            .map_err(decode_failed)?;
            Ok(Arc::new(value) as DecodedPayload)
        })
    };

    let operation: OperationFn = Arc::new(|payload: &(dyn Any + Send + Sync)| {
        payload
            .downcast_ref::<T>()
            .and_then(|value| value.operation())
            .map(str::trim)
            .filter(|op| !op.is_empty())
            .map(str::to_string)
    });

    TopicEntry {
        name,
        schema_version: topic.schema_version(),
        policy,
        encode,
        decode,
        operation,
        listeners: Vec::new(),
    }
}

fn erase_handler<T: TopicPayload>(topic: TopicName, handler: TypedHandler<T>) -> ErasedHandler {
    Arc::new(move |ctx: HandlerContext, payload: DecodedPayload| {
        let handler = handler.clone();
        let topic = topic.clone();
        async move {
            let Some(value) = payload.downcast_ref::<T>() else {
                return Err(GalaError::PayloadTypeMismatch {
                    topic,
                    expected: type_name::<T>(),
                }
                .into());
            };
            let value = value.clone();
            handler(ctx, value).await
        }
        .boxed()
    })
}

// ============================================================================
// Builders
// ============================================================================

/// Binds a topic to a codec and policy.
pub struct Registration<T> {
    topic: Topic<T>,
    codec: Option<Arc<dyn Codec<T>>>,
    policy: TopicPolicy,
}

impl<T: TopicPayload> Registration<T> {
    /// Registration without a codec; set one with [`Registration::codec`].
    pub fn new(topic: Topic<T>) -> Self {
        Self {
            topic,
            codec: None,
            policy: TopicPolicy::default(),
        }
    }

    pub fn json(topic: Topic<T>) -> Self
    where
        T: Serialize + DeserializeOwned,
    {
        Self::new(topic).codec(JsonCodec::<T>::new())
    }

    pub fn codec(mut self, codec: impl Codec<T>) -> Self {
        self.codec = Some(Arc::new(codec));
        self
    }

    pub fn policy(mut self, policy: TopicPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn emit_mode(mut self, emit_mode: EmitMode) -> Self {
        self.policy.emit_mode = emit_mode;
        self
    }

    pub fn queue_class(mut self, queue_class: QueueClass) -> Self {
        self.policy.queue_class = queue_class;
        self
    }

    pub fn register(self, registry: &Registry) -> Result<()> {
        registry.register_topic(self)
    }
}

/// A named listener for topic payloads of type `T`.
pub struct Definition<T> {
    topic: TopicName,
    name: String,
    operations: BTreeSet<String>,
    handler: Option<TypedHandler<T>>,
}

impl<T: TopicPayload> Definition<T> {
    pub fn new(topic: &Topic<T>, name: impl Into<String>) -> Self {
        Self {
            topic: topic.name().clone(),
            name: name.into(),
            operations: BTreeSet::new(),
            handler: None,
        }
    }

    /// Restrict the listener to these operations. Blank entries are ignored.
    pub fn operations<I, S>(mut self, operations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.operations.extend(
            operations
                .into_iter()
                .map(|op| op.into().trim().to_string())
                .filter(|op| !op.is_empty()),
        );
        self
    }

    pub fn handle<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(HandlerContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |ctx, payload| handler(ctx, payload).boxed()));
        self
    }

    pub fn attach(self, registry: &Registry) -> Result<ListenerId> {
        registry.attach_listener(self)
    }
}
