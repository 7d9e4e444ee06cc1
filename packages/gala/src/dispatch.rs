//! Durable dispatch boundary.
//!
//! The runtime hands envelopes for `Durable` and `Dual` topics to a
//! [`DurableDispatcher`]. The job-queue implementation is
//! [`QueueDispatcher`](crate::job::QueueDispatcher); tests use the recording
//! doubles in `testing`.

use async_trait::async_trait;

use crate::context::Context;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::topic::TopicPolicy;

/// Persists an envelope for later replay by a worker.
///
/// Returning `Ok` means the envelope was accepted; listener execution happens
/// elsewhere, when a worker calls
/// [`Runtime::dispatch_envelope`](crate::runtime::Runtime::dispatch_envelope).
#[async_trait]
pub trait DurableDispatcher: Send + Sync {
    async fn dispatch_durable(&self, ctx: &Context, envelope: Envelope, policy: &TopicPolicy) -> Result<()>;
}
