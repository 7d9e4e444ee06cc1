//! The event value delivered to listeners.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Reserved property holding the id used for handler idempotency.
pub const PROPERTY_EVENT_ID: &str = "event_id";

/// String-keyed bag of event metadata.
pub type Properties = BTreeMap<String, Value>;

/// Opaque client handle a bus attaches to every event it emits.
pub type Client = Arc<dyn Any + Send + Sync>;

/// One emission on a topic.
///
/// Clones share the `aborted` flag, so a listener that aborts is observed by
/// every listener that runs after it for the same emission.
#[derive(Clone)]
pub struct Event {
    topic: String,
    payload: Value,
    properties: Properties,
    aborted: Arc<AtomicBool>,
    cancellation: Option<CancellationToken>,
    client: Option<Client>,
}

impl Event {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            properties: Properties::new(),
            aborted: Arc::new(AtomicBool::new(false)),
            cancellation: None,
            client: None,
        }
    }

    /// Build an event carrying the given properties.
    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    /// Attach a cancellation token observable by listeners.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Deserialize the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    /// The idempotency id assigned at emit time, when non-blank.
    pub fn event_id(&self) -> Option<&str> {
        self.properties
            .get(PROPERTY_EVENT_ID)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// Mark the emission as aborted so later listeners are skipped.
    pub fn abort(&self) {
        self.set_aborted(true);
    }

    pub fn set_aborted(&self, aborted: bool) {
        self.aborted.store(aborted, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// The client handle set on the bus, downcast to its concrete type.
    pub fn client<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.client.clone().and_then(|c| c.downcast::<T>().ok())
    }

    pub(crate) fn has_client(&self) -> bool {
        self.client.is_some()
    }

    pub(crate) fn set_client(&mut self, client: Client) {
        self.client = Some(client);
    }

    /// Copy of this event published on a different topic, with its own abort flag.
    pub(crate) fn retarget(&self, topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            payload: self.payload.clone(),
            properties: self.properties.clone(),
            aborted: Arc::new(AtomicBool::new(self.is_aborted())),
            cancellation: self.cancellation.clone(),
            client: self.client.clone(),
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("topic", &self.topic)
            .field("payload", &self.payload)
            .field("properties", &self.properties)
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}
