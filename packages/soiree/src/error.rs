//! Error types for the soiree bus.
//!
//! Listener failures travel as `anyhow::Error` inside the bus and are
//! surfaced to callers as [`SoireeError::Listener`], keeping the listener id
//! so error handlers can tell which subscriber failed.

use thiserror::Error;

/// Errors returned by [`crate::EventBus`] operations and sent on emit channels.
#[derive(Debug, Error)]
pub enum SoireeError {
    /// Emit was called after the bus was closed.
    #[error("event bus is closed")]
    EmitterClosed,

    /// Close was called twice.
    #[error("event bus is already closed")]
    EmitterAlreadyClosed,

    /// The topic name is empty or contains empty segments.
    #[error("invalid topic name: {name:?}")]
    InvalidTopicName { name: String },

    /// No subscriptions exist for the topic pattern.
    #[error("unable to find topic '{topic}'")]
    TopicNotFound { topic: String },

    /// The listener id is not subscribed on the topic.
    #[error("listener '{listener_id}' not found on topic '{topic}'")]
    ListenerNotFound { topic: String, listener_id: String },

    /// An emitted event names a different topic than the emit call.
    #[error("emit topic {emit_topic:?} != event topic {event_topic:?}")]
    EventTopicMismatch {
        emit_topic: String,
        event_topic: String,
    },

    /// A listener panicked while handling an event.
    #[error("listener '{listener_id}' panicked: {message}")]
    ListenerPanicked {
        listener_id: String,
        message: String,
    },

    /// A listener returned an error after exhausting its retries.
    #[error("listener '{listener_id}' failed: {source}")]
    Listener {
        listener_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// Typed payload could not be converted to or from JSON.
    #[error("payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),

    /// The backing event store rejected an operation.
    #[error("event store error: {0}")]
    Store(#[source] anyhow::Error),
}

impl SoireeError {
    /// Listener id carried by listener-level failures.
    pub fn listener_id(&self) -> Option<&str> {
        match self {
            SoireeError::ListenerPanicked { listener_id, .. }
            | SoireeError::Listener { listener_id, .. } => Some(listener_id),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SoireeError>;
