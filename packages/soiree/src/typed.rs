//! Typed topics layered over the JSON payload bus.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::bus::EventBus;
use crate::error::{Result, SoireeError};
use crate::event::Event;
use crate::topic::{listener, ListenerOptions};

/// A topic whose payloads are always `T`.
pub struct TypedTopic<T> {
    name: String,
    _payload: PhantomData<fn() -> T>,
}

impl<T> TypedTopic<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _payload: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Clone for TypedTopic<T> {
    fn clone(&self) -> Self {
        Self::new(self.name.clone())
    }
}

impl<T> std::fmt::Debug for TypedTopic<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TypedTopic").field(&self.name).finish()
    }
}

impl EventBus {
    /// Subscribe a handler that receives the decoded payload and the event.
    pub fn on_topic<T, F, Fut>(&self, topic: &TypedTopic<T>, handler: F) -> Result<String>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_topic_with(topic, handler, ListenerOptions::default())
    }

    pub fn on_topic_with<T, F, Fut>(
        &self,
        topic: &TypedTopic<T>,
        handler: F,
        options: ListenerOptions,
    ) -> Result<String>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let name = topic.name().to_string();

        let listener = listener(move |event: Event| {
            let handler = handler.clone();
            let name = name.clone();
            async move {
                let payload = event
                    .payload_as::<T>()
                    .with_context(|| format!("payload on '{}' does not match the topic type", name))?;
                handler(payload, event).await
            }
        });

        self.on_with(topic.name(), listener, options)
    }

    /// Serialize and emit a typed payload.
    pub fn emit_topic<T: Serialize>(&self, topic: &TypedTopic<T>, payload: &T) -> mpsc::Receiver<SoireeError> {
        match serde_json::to_value(payload) {
            Ok(value) => self.emit(topic.name(), value),
            Err(e) => {
                let (tx, rx) = mpsc::channel(1);
                let _ = tx.try_send(SoireeError::Payload(e));
                rx
            }
        }
    }

    /// Serialize, emit, and wait for delivery.
    pub async fn emit_topic_sync<T: Serialize>(&self, topic: &TypedTopic<T>, payload: &T) -> Vec<SoireeError> {
        match serde_json::to_value(payload) {
            Ok(value) => self.emit_sync(topic.name(), value).await,
            Err(e) => vec![SoireeError::Payload(e)],
        }
    }
}
