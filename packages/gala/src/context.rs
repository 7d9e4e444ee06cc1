//! Request-scoped context and its capture/restore across the durable boundary.
//!
//! A [`Context`] carries typed values (one per type) plus an optional
//! cancellation token. At emit time the [`ContextManager`] asks each
//! registered [`ContextCodec`] to capture its value into a JSON
//! [`ContextSnapshot`]; at dispatch time the snapshot is folded back into a
//! fresh context so listeners see the same principal and flags no matter
//! which process runs them.
//!
//! # Example
//!
//! ```ignore
//! let manager = ContextManager::new();
//! manager.register(TypedContextCodec::<Actor>::new("actor"))?;
//!
//! let ctx = Context::background()
//!     .with_value(Actor { id: "member-1".into() })
//!     .with_flag(ContextFlag::WORKFLOW_BYPASS);
//!
//! let snapshot = manager.capture(&ctx)?;
//! let restored = manager.restore(&Context::background(), &snapshot)?;
//! assert_eq!(restored.value::<Actor>(), ctx.value::<Actor>());
//! ```

use std::any::{Any, TypeId};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use anyhow::Context as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{GalaError, Result};

// ============================================================================
// Context
// ============================================================================

type Values = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

/// Immutable bag of typed values. `with_*` methods return a new context.
#[derive(Clone, Default)]
pub struct Context {
    values: Arc<Values>,
    cancel: Option<CancellationToken>,
}

impl Context {
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_value<T: Any + Send + Sync>(&self, value: T) -> Self {
        let mut values = (*self.values).clone();
        values.insert(TypeId::of::<T>(), Arc::new(value));
        Self {
            values: Arc::new(values),
            cancel: self.cancel.clone(),
        }
    }

    pub fn value<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            values: self.values.clone(),
            cancel: Some(token),
        }
    }

    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Same values, detached from the caller's cancellation.
    pub fn without_cancel(&self) -> Self {
        Self {
            values: self.values.clone(),
            cancel: None,
        }
    }

    pub fn with_flag(&self, flag: ContextFlag) -> Self {
        let mut flags = self.flags().cloned().unwrap_or_default();
        flags.insert(flag);
        self.with_value(flags)
    }

    pub fn has_flag(&self, flag: &ContextFlag) -> bool {
        self.flags().is_some_and(|flags| flags.contains(flag))
    }

    pub fn flags(&self) -> Option<&ContextFlags> {
        self.value::<ContextFlags>()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("values", &self.values.len())
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

// ============================================================================
// Flags
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextFlag(Cow<'static, str>);

impl ContextFlag {
    /// Listener work triggered by a workflow should skip workflow hooks.
    pub const WORKFLOW_BYPASS: ContextFlag = ContextFlag(Cow::Borrowed("workflow_bypass"));
    /// Workflow-bypassed work may still emit events.
    pub const WORKFLOW_ALLOW_EVENT_EMISSION: ContextFlag =
        ContextFlag(Cow::Borrowed("workflow_allow_event_emission"));

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The set of boolean flags on a context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextFlags(BTreeSet<ContextFlag>);

impl ContextFlags {
    pub fn insert(&mut self, flag: ContextFlag) {
        self.0.insert(flag);
    }

    pub fn contains(&self, flag: &ContextFlag) -> bool {
        self.0.contains(flag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContextFlag> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// JSON-safe capture of registered context values and flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flags: BTreeMap<String, bool>,
}

impl ContextSnapshot {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.flags.is_empty()
    }
}

// ============================================================================
// Codecs
// ============================================================================

/// Captures and restores one context value under a stable key.
pub trait ContextCodec: Send + Sync {
    fn key(&self) -> &str;

    /// `Ok(None)` when the value is absent from `ctx`.
    fn capture(&self, ctx: &Context) -> anyhow::Result<Option<Value>>;

    fn restore(&self, ctx: Context, raw: &Value) -> anyhow::Result<Context>;
}

/// Codec for any serde type stored directly in the context.
pub struct TypedContextCodec<T> {
    key: String,
    _value: PhantomData<fn() -> T>,
}

impl<T> TypedContextCodec<T> {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            _value: PhantomData,
        }
    }
}

impl<T> ContextCodec for TypedContextCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn key(&self) -> &str {
        &self.key
    }

    fn capture(&self, ctx: &Context) -> anyhow::Result<Option<Value>> {
        ctx.value::<T>()
            .map(|value| serde_json::to_value(value).context("serialize context value"))
            .transpose()
    }

    fn restore(&self, ctx: Context, raw: &Value) -> anyhow::Result<Context> {
        let value: T = serde_json::from_value(raw.clone()).context("deserialize context value")?;
        Ok(ctx.with_value(value))
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Registered context codecs, iterated in key order.
#[derive(Default)]
pub struct ContextManager {
    codecs: RwLock<BTreeMap<String, Arc<dyn ContextCodec>>>,
}

impl ContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, codec: impl ContextCodec + 'static) -> Result<()> {
        let key = codec.key().trim().to_string();
        if key.is_empty() {
            return Err(GalaError::ContextCodecKeyRequired);
        }

        let mut codecs = self.codecs.write().unwrap_or_else(|e| e.into_inner());
        if codecs.contains_key(&key) {
            return Err(GalaError::ContextCodecAlreadyRegistered { key });
        }
        codecs.insert(key, Arc::new(codec));
        Ok(())
    }

    pub fn keys(&self) -> Vec<String> {
        self.snapshot_codecs().into_iter().map(|(key, _)| key).collect()
    }

    pub fn capture(&self, ctx: &Context) -> Result<ContextSnapshot> {
        let mut snapshot = ContextSnapshot::default();

        for (key, codec) in self.snapshot_codecs() {
            let captured = codec
                .capture(ctx)
                .map_err(|source| GalaError::ContextCaptureFailed {
                    key: key.clone(),
                    source,
                })?;
            if let Some(value) = captured {
                snapshot.values.insert(key, value);
            }
        }

        if let Some(flags) = ctx.flags() {
            for flag in flags.iter() {
                snapshot.flags.insert(flag.as_str().to_string(), true);
            }
        }

        Ok(snapshot)
    }

    /// Fold `snapshot` into `ctx`. Keys without a registered codec are skipped.
    pub fn restore(&self, ctx: &Context, snapshot: &ContextSnapshot) -> Result<Context> {
        let codecs: HashMap<String, Arc<dyn ContextCodec>> = self.snapshot_codecs().into_iter().collect();
        let mut restored = ctx.clone();

        for (key, raw) in &snapshot.values {
            let Some(codec) = codecs.get(key) else {
                debug!(key = %key, "skipping unknown context snapshot key");
                continue;
            };
            restored = codec
                .restore(restored, raw)
                .map_err(|source| GalaError::ContextSnapshotRestoreFailed {
                    key: key.clone(),
                    source,
                })?;
        }

        for (flag, enabled) in &snapshot.flags {
            if *enabled {
                restored = restored.with_flag(ContextFlag::new(flag.clone()));
            }
        }

        Ok(restored)
    }

    fn snapshot_codecs(&self) -> Vec<(String, Arc<dyn ContextCodec>)> {
        self.codecs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(key, codec)| (key.clone(), codec.clone()))
            .collect()
    }
}
