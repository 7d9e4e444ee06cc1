//! Structured errors for gala.
//!
//! `GalaError` is what crosses the public API. Listener handlers, codecs and
//! job backends return `anyhow::Result` internally; their causes are kept as
//! `#[source]` so callers can walk the chain.
//!
//! # Listener failures
//!
//! A failing listener is reported as [`ListenerError`], which records the
//! listener name and whether the failure was a recovered panic:
//!
//! ```ignore
//! match runtime.dispatch_envelope(&ctx, envelope).await {
//!     Err(GalaError::Listener(err)) if err.panicked => {
//!         // cause downcasts to GalaError::ListenerPanicked
//!     }
//!     Err(GalaError::Listener(err)) => {
//!         let original = err.cause.downcast_ref::<MyDomainError>();
//!     }
//!     _ => {}
//! }
//! ```

use thiserror::Error;

use crate::envelope::EventId;
use crate::topic::TopicName;

pub type Result<T> = std::result::Result<T, GalaError>;

#[derive(Debug, Error)]
pub enum GalaError {
    // ===== Registration =====
    #[error("topic name is required")]
    TopicNameRequired,

    #[error("codec is required for topic {topic}")]
    CodecRequired { topic: TopicName },

    #[error("topic already registered: {topic}")]
    TopicAlreadyRegistered { topic: TopicName },

    #[error("topic not registered: {topic}")]
    TopicNotRegistered { topic: TopicName },

    #[error("listener {listener} targets unregistered topic {topic}")]
    ListenerTopicNotRegistered { topic: TopicName, listener: String },

    #[error("listener name is required for topic {topic}")]
    ListenerNameRequired { topic: TopicName },

    #[error("listener {listener} has no handler")]
    ListenerHandlerRequired { listener: String },

    // ===== Payloads =====
    #[error("failed to encode payload for topic {topic}")]
    PayloadEncodeFailed {
        topic: TopicName,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to decode payload for topic {topic}")]
    PayloadDecodeFailed {
        topic: TopicName,
        #[source]
        source: anyhow::Error,
    },

    #[error("payload for topic {topic} is not a {expected}")]
    PayloadTypeMismatch {
        topic: TopicName,
        expected: &'static str,
    },

    #[error("topic {topic} supports schema version {supported}, envelope carries {version}")]
    UnsupportedSchemaVersion {
        topic: TopicName,
        version: u32,
        supported: u32,
    },

    // ===== Dispatch =====
    #[error("invalid dispatch mode: {mode}")]
    DispatchModeInvalid { mode: String },

    #[error("durable dispatcher is required for topic {topic}")]
    DurableDispatcherRequired { topic: TopicName },

    #[error("dispatcher is closed")]
    DispatcherClosed,

    #[error("dispatch failed for event {event_id}")]
    DispatchFailed {
        event_id: EventId,
        #[source]
        source: Box<GalaError>,
    },

    // ===== Context =====
    #[error("context codec key is required")]
    ContextCodecKeyRequired,

    #[error("context codec already registered: {key}")]
    ContextCodecAlreadyRegistered { key: String },

    #[error("failed to capture context value {key}")]
    ContextCaptureFailed {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to restore context value {key}")]
    ContextSnapshotRestoreFailed {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    // ===== Listeners =====
    #[error("listener panicked: {message}")]
    ListenerPanicked { message: String },

    #[error(transparent)]
    Listener(#[from] ListenerError),

    // ===== Jobs =====
    #[error("job client is required for durable dispatch")]
    JobClientRequired,

    #[error("job store is required to run durable workers")]
    JobStoreRequired,

    #[error("job carries no envelope")]
    JobEnvelopeRequired,

    #[error("failed to encode envelope")]
    EnvelopeEncodeFailed(#[source] serde_json::Error),

    #[error("failed to decode envelope")]
    EnvelopeDecodeFailed(#[source] serde_json::Error),

    #[error("failed to insert job into queue {queue}")]
    JobInsertFailed {
        queue: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("no runtime available to dispatch job")]
    RuntimeProviderRequired,

    #[error("dependency not provided: {type_name}")]
    DependencyNotProvided { type_name: &'static str },

    #[error("{}", join_messages(.0))]
    Joined(Vec<GalaError>),
}

impl GalaError {
    /// Combine errors. Nested joins are flattened; no errors yields `None`
    /// and a single error is returned as-is.
    pub fn join(errors: impl IntoIterator<Item = GalaError>) -> Option<GalaError> {
        let mut flat = Vec::new();
        for error in errors {
            match error {
                GalaError::Joined(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }

        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(GalaError::Joined(flat)),
        }
    }

    /// Iterate this error and, for joined errors, every member.
    pub fn flatten(&self) -> Box<dyn Iterator<Item = &GalaError> + '_> {
        match self {
            GalaError::Joined(inner) => Box::new(inner.iter().flat_map(GalaError::flatten)),
            other => Box::new(std::iter::once(other)),
        }
    }

    /// The listener failure inside this error, looking through dispatch
    /// wrappers and joins.
    pub fn listener_error(&self) -> Option<&ListenerError> {
        match self {
            GalaError::Listener(err) => Some(err),
            GalaError::DispatchFailed { source, .. } => source.listener_error(),
            GalaError::Joined(inner) => inner.iter().find_map(GalaError::listener_error),
            _ => None,
        }
    }
}

fn join_messages(errors: &[GalaError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A listener returned an error or panicked.
#[derive(Debug, Error)]
#[error("listener {listener} failed: {cause}")]
pub struct ListenerError {
    pub listener: String,
    pub panicked: bool,
    #[source]
    pub cause: anyhow::Error,
}

impl ListenerError {
    pub fn failed(listener: impl Into<String>, cause: anyhow::Error) -> Self {
        Self {
            listener: listener.into(),
            panicked: false,
            cause,
        }
    }

    pub fn panicked(listener: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            listener: listener.into(),
            panicked: true,
            cause: anyhow::Error::new(GalaError::ListenerPanicked {
                message: message.into(),
            }),
        }
    }

    /// True when the cause is a recovered panic.
    pub fn is_panic(&self) -> bool {
        matches!(
            self.cause.downcast_ref::<GalaError>(),
            Some(GalaError::ListenerPanicked { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_join_drops_empty_and_unwraps_single() {
        assert!(GalaError::join(Vec::new()).is_none());

        let single = GalaError::join(vec![GalaError::TopicNameRequired]);
        assert!(matches!(single, Some(GalaError::TopicNameRequired)));
    }

    #[test]
    fn test_join_flattens_nested() {
        let nested = GalaError::Joined(vec![
            GalaError::TopicNameRequired,
            GalaError::JobClientRequired,
        ]);
        let joined = GalaError::join(vec![nested, GalaError::DispatcherClosed]).unwrap();

        let members: Vec<_> = joined.flatten().collect();
        assert_eq!(members.len(), 3);
        assert!(joined.to_string().contains("dispatcher is closed"));
    }

    #[test]
    fn test_panicked_listener_error_downcasts_to_listener_panicked() {
        let err = ListenerError::panicked("audit", "boom");
        assert!(err.panicked);
        assert!(err.is_panic());

        let source = err.source().unwrap();
        assert!(source.to_string().contains("boom"));
    }

    #[test]
    fn test_failed_listener_error_keeps_original_cause() {
        #[derive(Debug, Error)]
        #[error("domain failure")]
        struct DomainError;

        let err = ListenerError::failed("audit", anyhow::Error::new(DomainError));
        assert!(!err.panicked);
        assert!(!err.is_panic());
        assert!(err.cause.downcast_ref::<DomainError>().is_some());
    }

    #[test]
    fn test_listener_error_found_through_dispatch_wrapper() {
        let err = GalaError::DispatchFailed {
            event_id: EventId::from("evt_1"),
            source: Box::new(GalaError::Listener(ListenerError::panicked("x", "y"))),
        };

        assert_eq!(err.listener_error().unwrap().listener, "x");
    }
}
