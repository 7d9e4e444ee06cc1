//! The durable unit of transport.
//!
//! An [`Envelope`] is built once per emit and never mutated afterwards. Its
//! JSON form is the durable job argument and must stay readable across
//! deploys:
//!
//! ```text
//! {
//!   "id": "0192...",
//!   "topic": "member.created",
//!   "schema_version": 1,
//!   "occurred_at": "2026-01-01T00:00:00Z",
//!   "headers": { "idempotency_key": "...", "properties": { ... } },
//!   "payload": "<base64 bytes>",
//!   "context_snapshot": { "values": { ... }, "flags": { ... } }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::ContextSnapshot;
use crate::error::{GalaError, Result};
use crate::topic::TopicName;

/// Unique event identifier. Generated ids are UUIDv7 and sort by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for EventId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Per-emit metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    /// Physical queue override for durable dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    /// Max-attempts override for durable dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: EventId,
    pub topic: TopicName,
    #[serde(default)]
    pub schema_version: u32,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub headers: Headers,
    #[serde(with = "payload_bytes")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub context_snapshot: ContextSnapshot,
}

impl Envelope {
    /// New envelope with a fresh id, stamped now.
    pub fn new(topic: impl Into<TopicName>, payload: Vec<u8>) -> Self {
        Self {
            id: EventId::new(),
            topic: topic.into(),
            schema_version: 1,
            occurred_at: Utc::now(),
            headers: Headers::default(),
            payload,
            context_snapshot: ContextSnapshot::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<EventId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_context_snapshot(mut self, snapshot: ContextSnapshot) -> Self {
        self.context_snapshot = snapshot;
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(GalaError::EnvelopeEncodeFailed)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(GalaError::EnvelopeDecodeFailed)
    }
}

/// Outcome of one emit call. Not persisted.
#[derive(Debug)]
pub struct EmitReceipt {
    /// Absent when the emit failed before an envelope was built.
    pub event_id: Option<EventId>,
    pub accepted: bool,
    pub error: Option<GalaError>,
}

impl EmitReceipt {
    pub(crate) fn accepted(event_id: EventId) -> Self {
        Self {
            event_id: Some(event_id),
            accepted: true,
            error: None,
        }
    }

    pub(crate) fn rejected(event_id: Option<EventId>, error: GalaError) -> Self {
        Self {
            event_id,
            accepted: false,
            error: Some(error),
        }
    }
}

mod payload_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
