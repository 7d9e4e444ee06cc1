//! # Gala
//!
//! Typed, versioned event topics delivered to named listeners inline, through
//! a durable job queue, or both.
//!
//! ## Core Concepts
//!
//! - [`Topic`] = a named, typed channel with a schema version
//! - [`Registry`] = topics with their codecs and emit policies, plus the
//!   ordered listeners attached to each
//! - [`Envelope`] = one emitted event in wire form: id, topic, encoded
//!   payload, headers, and a snapshot of request context
//! - [`Runtime`] = routes envelopes by [`EmitMode`] and dispatches them to
//!   listeners
//!
//! ## Architecture
//!
//! ```text
//! emit ─► Registry (encode) ─► ContextManager (capture) ─► Envelope
//!                                                             │
//!                          ┌──────────── EmitMode ────────────┤
//!                          │                                  │
//!                   Inline ▼                          Durable ▼
//!           Runtime::dispatch_envelope          DurableDispatcher
//!                          ▲                                  │
//!                          │                                  ▼
//!                   DispatchWorker ◄── JobWorker ◄── JobStore / JobClient
//! ```
//!
//! ## Guarantees
//!
//! - **Ordered, fail-fast dispatch**: listeners run in registration order and
//!   the first failure or panic stops the rest
//! - **Panic capture**: a panicking listener becomes a [`ListenerError`]
//!   whose cause is [`GalaError::ListenerPanicked`]
//! - **Context survives the queue**: registered context codecs and flags are
//!   restored before listeners run, whichever process runs them
//! - **Schema gate**: envelopes newer than the registered topic version are
//!   rejected, not misread
//!
//! ## Example
//!
//! ```ignore
//! use gala::{Definition, Headers, Registration, Runtime, Topic};
//!
//! let runtime = Runtime::new();
//! let topic = Topic::<MemberCreated>::new("member.created");
//!
//! Registration::json(topic.clone()).register(runtime.registry())?;
//! Definition::new(&topic, "send_welcome")
//!     .handle(|ctx, member| async move {
//!         let mailer = ctx.resolve::<Mailer>()?;
//!         mailer.welcome(&member).await
//!     })
//!     .attach(runtime.registry())?;
//!
//! let receipt = runtime
//!     .emit_typed(&Context::background(), &topic, &member, Headers::new())
//!     .await;
//! assert!(receipt.accepted);
//! ```

mod codec;
pub mod config;
mod context;
mod dispatch;
mod envelope;
mod error;
mod gala;
mod injector;
pub mod job;
mod registry;
mod runtime;
pub mod telemetry;
mod topic;
pub mod worker;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod runtime_tests;

#[cfg(test)]
mod gala_tests;

pub use codec::{Codec, JsonCodec};
pub use config::{DispatchMode, GalaConfig};
pub use context::{
    Context, ContextCodec, ContextFlag, ContextFlags, ContextManager, ContextSnapshot, TypedContextCodec,
};
pub use dispatch::DurableDispatcher;
pub use envelope::{EmitReceipt, Envelope, EventId, Headers};
pub use error::{GalaError, ListenerError, Result};
pub use gala::{Gala, GalaBuilder};
pub use injector::{HandlerContext, Injector};
pub use job::{
    ClaimedJob, DispatchJobArgs, DispatchWorker, FailureKind, JobClient, JobInsert, JobStore, MemoryJobQueue,
    QueueDispatcher,
};
pub use registry::{DecodedPayload, Definition, ListenerId, Registration, RegisteredListener, Registry};
pub use runtime::{Runtime, RuntimeBuilder};
pub use topic::{EmitMode, PayloadHook, QueueClass, Topic, TopicName, TopicPayload, TopicPolicy};
pub use worker::{JobWorker, JobWorkerConfig};

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
