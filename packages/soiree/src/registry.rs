//! Coordinated shutdown for every bus a process creates.
//!
//! The registry is owned by the application's lifecycle code and handed to
//! each bus at build time. Buses remove themselves on `close` or drop, and
//! [`BusRegistry::shutdown_all`] closes whatever is still open.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, warn};

use crate::bus::{BusInner, EventBus};
use crate::error::SoireeError;

type Entries = HashMap<u64, Weak<BusInner>>;

#[derive(Clone, Default)]
pub struct BusRegistry {
    entries: Arc<Mutex<Entries>>,
}

impl BusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open buses still registered.
    pub fn len(&self) -> usize {
        lock(&self.entries)
            .values()
            .filter(|bus| bus.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every registered bus. Returns how many were closed.
    pub fn shutdown_all(&self) -> usize {
        let buses: Vec<EventBus> = lock(&self.entries)
            .drain()
            .filter_map(|(_, bus)| bus.upgrade())
            .map(EventBus::from_inner)
            .collect();

        let mut closed = 0;
        for bus in buses {
            match bus.close() {
                Ok(()) => closed += 1,
                Err(SoireeError::EmitterAlreadyClosed) => {}
                Err(e) => warn!(error = %e, "failed to close event bus during shutdown"),
            }
        }

        debug!(closed, "event buses shut down");
        closed
    }

    pub(crate) fn handle(&self) -> RegistryHandle {
        RegistryHandle {
            entries: Arc::downgrade(&self.entries),
        }
    }
}

/// Weak back-reference a bus keeps to its registry.
#[derive(Clone)]
pub(crate) struct RegistryHandle {
    entries: Weak<Mutex<Entries>>,
}

impl RegistryHandle {
    pub(crate) fn register(&self, id: u64, bus: Weak<BusInner>) {
        if let Some(entries) = self.entries.upgrade() {
            let mut entries = lock(&entries);
            entries.retain(|_, bus| bus.strong_count() > 0);
            entries.insert(id, bus);
        }
    }

    pub(crate) fn deregister(&self, id: u64) {
        if let Some(entries) = self.entries.upgrade() {
            lock(&entries).remove(&id);
        }
    }
}

fn lock(entries: &Mutex<Entries>) -> MutexGuard<'_, Entries> {
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
