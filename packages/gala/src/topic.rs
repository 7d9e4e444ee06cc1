//! Topic model: names, typed topics, emit modes and queue classes.

use std::borrow::{Borrow, Cow};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::GalaError;

/// Globally unique topic key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicName(String);

impl TopicName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for empty or whitespace-only names.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TopicName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for TopicName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl Borrow<str> for TopicName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for TopicName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Byte transform applied after encode (`wrap`) or before decode (`unwrap`).
pub type PayloadHook = Arc<dyn Fn(Vec<u8>) -> anyhow::Result<Vec<u8>> + Send + Sync>;

/// A named, versioned channel for payloads of type `T`.
pub struct Topic<T> {
    name: TopicName,
    schema_version: u32,
    wrap: Option<PayloadHook>,
    unwrap: Option<PayloadHook>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Topic<T> {
    pub fn new(name: impl Into<TopicName>) -> Self {
        Self {
            name: name.into(),
            schema_version: 1,
            wrap: None,
            unwrap: None,
            _payload: PhantomData,
        }
    }

    /// Set the schema version. Zero is treated as 1.
    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version.max(1);
        self
    }

    pub fn with_wrap<F>(mut self, wrap: F) -> Self
    where
        F: Fn(Vec<u8>) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.wrap = Some(Arc::new(wrap));
        self
    }

    pub fn with_unwrap<F>(mut self, unwrap: F) -> Self
    where
        F: Fn(Vec<u8>) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.unwrap = Some(Arc::new(unwrap));
        self
    }

    pub fn name(&self) -> &TopicName {
        &self.name
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub(crate) fn hooks(&self) -> (Option<PayloadHook>, Option<PayloadHook>) {
        (self.wrap.clone(), self.unwrap.clone())
    }
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            schema_version: self.schema_version,
            wrap: self.wrap.clone(),
            unwrap: self.unwrap.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Topic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("schema_version", &self.schema_version)
            .field("payload", &std::any::type_name::<T>())
            .finish()
    }
}

/// Payload types carried by topics.
///
/// `operation` lets a payload opt into listener operation filters; payloads
/// that return `None` only reach listeners without a filter.
pub trait TopicPayload: Clone + Send + Sync + 'static {
    fn operation(&self) -> Option<&str> {
        None
    }
}

/// Untyped JSON payloads expose a top-level `operation` string field.
impl TopicPayload for serde_json::Value {
    fn operation(&self) -> Option<&str> {
        self.get("operation").and_then(serde_json::Value::as_str)
    }
}

/// Where an emitted envelope goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmitMode {
    /// Dispatch in the emitting process.
    #[default]
    Inline,
    /// Enqueue for a worker.
    Durable,
    /// Both; failures from either side are joined.
    Dual,
}

impl EmitMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmitMode::Inline => "inline",
            EmitMode::Durable => "durable",
            EmitMode::Dual => "dual",
        }
    }
}

impl fmt::Display for EmitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmitMode {
    type Err = GalaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "inline" => Ok(EmitMode::Inline),
            "durable" => Ok(EmitMode::Durable),
            "dual" => Ok(EmitMode::Dual),
            other => Err(GalaError::DispatchModeInvalid {
                mode: other.to_string(),
            }),
        }
    }
}

/// Logical queue bucket, mapped to a physical queue name by the durable
/// dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueClass(Cow<'static, str>);

impl QueueClass {
    pub const WORKFLOW: QueueClass = QueueClass(Cow::Borrowed("workflow"));
    pub const INTEGRATION: QueueClass = QueueClass(Cow::Borrowed("integration"));
    pub const GENERAL: QueueClass = QueueClass(Cow::Borrowed("general"));

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for QueueClass {
    fn default() -> Self {
        Self::GENERAL
    }
}

impl fmt::Display for QueueClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a topic is dispatched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicPolicy {
    pub emit_mode: EmitMode,
    pub queue_class: QueueClass,
}

impl TopicPolicy {
    pub fn new(emit_mode: EmitMode) -> Self {
        Self {
            emit_mode,
            ..Default::default()
        }
    }

    pub fn with_queue_class(mut self, queue_class: QueueClass) -> Self {
        self.queue_class = queue_class;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_topic_defaults() {
        let topic = Topic::<serde_json::Value>::new("member.created");
        assert_eq!(topic.name().as_str(), "member.created");
        assert_eq!(topic.schema_version(), 1);
        assert_eq!(Topic::<serde_json::Value>::new("x").with_schema_version(0).schema_version(), 1);
    }

    #[test]
    fn test_blank_topic_name() {
        assert!(TopicName::from("  ").is_blank());
        assert!(!TopicName::from("a").is_blank());
    }

    #[test]
    fn test_emit_mode_parse() {
        assert_eq!("".parse::<EmitMode>().unwrap(), EmitMode::Inline);
        assert_eq!("Durable".parse::<EmitMode>().unwrap(), EmitMode::Durable);
        assert_eq!("dual".parse::<EmitMode>().unwrap(), EmitMode::Dual);

        let err = "sideways".parse::<EmitMode>().unwrap_err();
        assert!(matches!(err, GalaError::DispatchModeInvalid { mode } if mode == "sideways"));
    }

    #[test]
    fn test_policy_defaults_to_inline_general() {
        let policy = TopicPolicy::default();
        assert_eq!(policy.emit_mode, EmitMode::Inline);
        assert_eq!(policy.queue_class, QueueClass::GENERAL);
    }

    #[test]
    fn test_queue_class_owned_equals_const() {
        assert_eq!(QueueClass::new("workflow"), QueueClass::WORKFLOW);
    }

    #[test]
    fn test_json_value_operation() {
        assert_eq!(json!({"operation": "create"}).operation(), Some("create"));
        assert_eq!(json!({"op": "create"}).operation(), None);
    }
}
