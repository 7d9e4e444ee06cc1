//! Test doubles for the durable boundary.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! gala = { path = "../gala", features = ["testing"] }
//! ```
//!
//! # Example
//!
//! ```ignore
//! use gala::testing::RecordingDispatcher;
//!
//! let spy = RecordingDispatcher::new();
//! let runtime = Runtime::builder().durable_dispatcher(spy.clone()).build();
//!
//! runtime.emit_typed(&ctx, &member_created, &member, Headers::new()).await;
//!
//! assert_eq!(spy.calls(), 1);
//! assert_eq!(spy.envelopes()[0].topic, *member_created.name());
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use async_trait::async_trait;
use uuid::Uuid;

use crate::context::Context;
use crate::dispatch::DurableDispatcher;
use crate::envelope::Envelope;
use crate::error::{GalaError, Result};
use crate::job::{JobClient, JobInsert};
use crate::topic::TopicPolicy;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Accepts every envelope and remembers it with the policy it was sent under.
#[derive(Debug, Clone, Default)]
pub struct RecordingDispatcher {
    dispatched: Arc<Mutex<Vec<(Envelope, TopicPolicy)>>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        lock(&self.dispatched).len()
    }

    pub fn envelopes(&self) -> Vec<Envelope> {
        lock(&self.dispatched).iter().map(|(envelope, _)| envelope.clone()).collect()
    }

    pub fn policies(&self) -> Vec<TopicPolicy> {
        lock(&self.dispatched).iter().map(|(_, policy)| policy.clone()).collect()
    }

    pub fn clear(&self) {
        lock(&self.dispatched).clear();
    }
}

#[async_trait]
impl DurableDispatcher for RecordingDispatcher {
    async fn dispatch_durable(&self, _ctx: &Context, envelope: Envelope, policy: &TopicPolicy) -> Result<()> {
        lock(&self.dispatched).push((envelope, policy.clone()));
        Ok(())
    }
}

/// Rejects every envelope as a failed job insert.
#[derive(Debug, Clone, Default)]
pub struct FailingDispatcher {
    calls: Arc<AtomicUsize>,
}

impl FailingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DurableDispatcher for FailingDispatcher {
    async fn dispatch_durable(&self, _ctx: &Context, envelope: Envelope, _policy: &TopicPolicy) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(GalaError::JobInsertFailed {
            queue: "test".to_string(),
            source: anyhow!("durable dispatch failed for {}", envelope.id),
        })
    }
}

/// Records job inserts, optionally failing each one.
#[derive(Debug, Clone, Default)]
pub struct RecordingJobClient {
    inserted: Arc<Mutex<Vec<JobInsert>>>,
    fail_with: Option<String>,
}

impl RecordingJobClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// A client whose inserts all fail with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail_with: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn inserted(&self) -> Vec<JobInsert> {
        lock(&self.inserted).clone()
    }

    pub fn job_count(&self) -> usize {
        lock(&self.inserted).len()
    }
}

#[async_trait]
impl JobClient for RecordingJobClient {
    async fn insert(&self, job: JobInsert) -> anyhow::Result<Uuid> {
        if let Some(message) = &self.fail_with {
            return Err(anyhow!("{message}"));
        }
        lock(&self.inserted).push(job);
        Ok(Uuid::now_v7())
    }
}
