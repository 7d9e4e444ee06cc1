//! Persistence capabilities a bus can be configured with.
//!
//! - [`EventStore`] - records emitted events and per-listener results
//! - [`EventQueue`] - durable hand-off; when configured, `emit` enqueues and a
//!   background consumer dispatches
//! - [`HandlerResultDeduper`] - lets a redelivered event skip listeners that
//!   already succeeded for its id
//!
//! [`MemoryStore`] implements all three in-process.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::event::{Event, Properties};

#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Record an emitted event.
    async fn save_event(&self, event: &Event) -> anyhow::Result<()>;

    /// Record the outcome of one listener attempt.
    async fn save_handler_result(
        &self,
        event: &Event,
        handler_id: &str,
        error: Option<&str>,
    ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait EventQueue: Send + Sync + 'static {
    /// Hand an event to the queue for later delivery.
    async fn enqueue_event(&self, event: &Event) -> anyhow::Result<()>;

    /// Wait for the next queued event. Returns `Ok(None)` once `cancel` fires.
    async fn dequeue_event(&self, cancel: &CancellationToken) -> anyhow::Result<Option<Event>>;
}

#[async_trait]
pub trait HandlerResultDeduper: Send + Sync + 'static {
    async fn handler_succeeded(&self, event_id: &str, handler_id: &str) -> anyhow::Result<bool>;
}

/// Serialized form of an event in a store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredEvent {
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Properties::is_empty")]
    pub properties: Properties,
}

impl From<&Event> for StoredEvent {
    fn from(event: &Event) -> Self {
        Self {
            topic: event.topic().to_string(),
            payload: event.payload().clone(),
            properties: event.properties().clone(),
        }
    }
}

impl From<StoredEvent> for Event {
    fn from(stored: StoredEvent) -> Self {
        Event::new(stored.topic, stored.payload).with_properties(stored.properties)
    }
}

/// One recorded listener attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredResult {
    pub topic: String,
    pub handler_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl StoredResult {
    pub fn new(event: &Event, handler_id: &str, error: Option<&str>) -> Self {
        Self {
            topic: event.topic().to_string(),
            handler_id: handler_id.to_string(),
            event_id: event.event_id().unwrap_or_default().to_string(),
            error: error.unwrap_or_default().to_string(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_empty()
    }
}

#[derive(Default)]
struct MemoryState {
    events: Vec<StoredEvent>,
    queue: VecDeque<StoredEvent>,
    results: Vec<StoredResult>,
    succeeded: HashMap<String, HashSet<String>>,
}

/// In-process store, queue and deduper.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    queued: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn events(&self) -> Vec<Event> {
        self.lock().events.iter().cloned().map(Event::from).collect()
    }

    pub fn results(&self) -> Vec<StoredResult> {
        self.lock().results.clone()
    }

    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn save_event(&self, event: &Event) -> anyhow::Result<()> {
        self.lock().events.push(StoredEvent::from(event));
        Ok(())
    }

    async fn save_handler_result(
        &self,
        event: &Event,
        handler_id: &str,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        let result = StoredResult::new(event, handler_id, error);
        let mut state = self.lock();

        if result.succeeded() && !result.event_id.is_empty() && !handler_id.is_empty() {
            state
                .succeeded
                .entry(result.event_id.clone())
                .or_default()
                .insert(handler_id.to_string());
        }
        state.results.push(result);

        Ok(())
    }
}

#[async_trait]
impl EventQueue for MemoryStore {
    async fn enqueue_event(&self, event: &Event) -> anyhow::Result<()> {
        self.lock().queue.push_back(StoredEvent::from(event));
        self.queued.notify_one();
        Ok(())
    }

    async fn dequeue_event(&self, cancel: &CancellationToken) -> anyhow::Result<Option<Event>> {
        loop {
            let notified = self.queued.notified();

            if let Some(stored) = self.lock().queue.pop_front() {
                return Ok(Some(stored.into()));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = notified => {}
            }
        }
    }
}

#[async_trait]
impl HandlerResultDeduper for MemoryStore {
    async fn handler_succeeded(&self, event_id: &str, handler_id: &str) -> anyhow::Result<bool> {
        if event_id.trim().is_empty() || handler_id.trim().is_empty() {
            return Ok(false);
        }

        Ok(self
            .lock()
            .succeeded
            .get(event_id)
            .is_some_and(|handlers| handlers.contains(handler_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PROPERTY_EVENT_ID;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn event_with_id(id: &str) -> Event {
        let mut event = Event::new("orders.placed", json!({"total": 10}));
        event.set_property(PROPERTY_EVENT_ID, id);
        event
    }

    #[tokio::test]
    async fn test_only_successful_results_are_deduplicated() {
        let store = MemoryStore::new();
        let event = event_with_id("evt-1");

        store.save_handler_result(&event, "h1", Some("boom")).await.unwrap();
        assert!(!store.handler_succeeded("evt-1", "h1").await.unwrap());

        store.save_handler_result(&event, "h1", None).await.unwrap();
        assert!(store.handler_succeeded("evt-1", "h1").await.unwrap());
        assert!(!store.handler_succeeded("evt-1", "h2").await.unwrap());
        assert_eq!(store.results().len(), 2);
    }

    #[tokio::test]
    async fn test_save_event_does_not_enqueue() {
        let store = MemoryStore::new();
        store.save_event(&event_with_id("evt-3")).await.unwrap();

        assert_eq!(store.events().len(), 1);
        assert_eq!(store.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_enqueue() {
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();

        let consumer = {
            let store = store.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { store.dequeue_event(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.enqueue_event(&event_with_id("evt-2")).await.unwrap();

        let event = consumer.await.unwrap().unwrap().expect("event");
        assert_eq!(event.topic(), "orders.placed");
        assert_eq!(event.event_id(), Some("evt-2"));
        assert_eq!(store.queue_len(), 0);
        assert!(store.events().is_empty());
    }

    #[tokio::test]
    async fn test_dequeue_returns_none_on_cancel() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(store.dequeue_event(&cancel).await.unwrap().is_none());
    }

    #[test]
    fn test_stored_event_omits_empty_properties() {
        let stored = StoredEvent::from(&Event::new("a.b", json!(1)));
        let json = serde_json::to_value(&stored).unwrap();

        assert_eq!(json, json!({"topic": "a.b", "payload": 1}));
    }
}
