//! # Soiree
//!
//! Topic-pattern pub/sub: listeners subscribe to `.`-separated patterns with
//! `*` / `**` wildcards and a [`Priority`], and every emission is delivered to
//! each matching pattern, most specific first, highest priority first.
//!
//! ## Example
//!
//! ```ignore
//! use soiree::{listener, EventBus, Priority};
//! use serde_json::json;
//!
//! let bus = EventBus::builder().max_retries(3).build();
//!
//! bus.on_with_priority("orders.*", listener(|event| async move {
//!     if event.payload()["total"] == 0 {
//!         event.abort();
//!     }
//!     Ok(())
//! }), Priority::Highest)?;
//!
//! let errors = bus.emit_sync("orders.placed", json!({"total": 42})).await;
//! assert!(errors.is_empty());
//! ```
//!
//! ## Guarantees
//!
//! - **Collect-all**: every listener failure is reported; only an aborted
//!   event stops delivery early
//! - **Per-call panic isolation**: a panicking listener becomes
//!   [`SoireeError::ListenerPanicked`] and delivery continues
//! - **At-least-once with a queue store**: redelivered events skip listeners
//!   the deduper has recorded as succeeded

pub mod backoff;
mod bus;
mod error;
mod event;
pub mod pattern;
mod pool;
#[cfg(feature = "redis")]
pub mod redis_store;
mod registry;
pub mod store;
mod topic;
mod typed;


pub use backoff::{Backoff, BackoffFactory, ConstantBackoff, ExponentialBackoff};
pub use bus::{
    Emission, ErrorHandler, EventBus, EventBusBuilder, IdGenerator, ListenerBinding, PanicHandler,
};
pub use error::{Result, SoireeError};
pub use event::{Client, Event, Properties, PROPERTY_EVENT_ID};
pub use pattern::match_topic_pattern;
pub use pool::{panic_message, Pool, PoolBuilder};
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
pub use registry::BusRegistry;
pub use store::{EventQueue, EventStore, HandlerResultDeduper, MemoryStore};
pub use topic::{listener, middleware, Listener, ListenerFuture, ListenerOptions, Middleware, Priority};
pub use typed::TypedTopic;
