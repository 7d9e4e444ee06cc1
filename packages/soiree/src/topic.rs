//! Listener types and per-pattern subscription lists.

use std::future::Future;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::future::BoxFuture;

use crate::error::{Result, SoireeError};
use crate::event::Event;

/// Delivery priority. Higher priorities run first within one pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
}

pub type ListenerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// A type-erased async listener.
pub type Listener = Arc<dyn Fn(Event) -> ListenerFuture + Send + Sync>;

/// Wraps a listener with behavior that runs around it.
pub type Middleware = Arc<dyn Fn(Listener) -> Listener + Send + Sync>;

/// Box an async closure into a [`Listener`].
///
/// # Example
///
/// ```ignore
/// bus.on("user.*", soiree::listener(|event| async move {
///     tracing::info!(topic = event.topic(), "user event");
///     Ok(())
/// }))?;
/// ```
pub fn listener<F, Fut>(f: F) -> Listener
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// Box a listener-wrapping closure into a [`Middleware`].
pub fn middleware<F>(f: F) -> Middleware
where
    F: Fn(Listener) -> Listener + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Options applied when subscribing a listener.
#[derive(Clone, Default)]
pub struct ListenerOptions {
    pub priority: Priority,
    pub middleware: Vec<Middleware>,
}

impl ListenerOptions {
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Add a middleware. The first one added is the outermost.
    pub fn middleware(mut self, middleware: Middleware) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub(crate) fn wrap(&self, listener: Listener) -> Listener {
        self.middleware
            .iter()
            .rev()
            .fold(listener, |next, mw| mw(next))
    }
}

struct Subscription {
    id: String,
    priority: Priority,
    listener: Listener,
}

/// Subscriptions registered under one topic pattern, kept in delivery order.
#[derive(Default)]
pub(crate) struct TopicListeners {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl TopicListeners {
    fn read(&self) -> RwLockReadGuard<'_, Vec<Subscription>> {
        self.subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Subscription>> {
        self.subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert after every subscription of equal or higher priority.
    pub(crate) fn add(&self, id: String, priority: Priority, listener: Listener) {
        let mut subs = self.write();
        let at = subs
            .iter()
            .position(|s| s.priority < priority)
            .unwrap_or(subs.len());
        subs.insert(
            at,
            Subscription {
                id,
                priority,
                listener,
            },
        );
    }

    pub(crate) fn remove(&self, topic: &str, id: &str) -> Result<()> {
        let mut subs = self.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);

        if subs.len() == before {
            return Err(SoireeError::ListenerNotFound {
                topic: topic.to_string(),
                listener_id: id.to_string(),
            });
        }

        Ok(())
    }

    /// Copy of the listeners in delivery order, taken without holding the lock afterwards.
    pub(crate) fn snapshot(&self) -> Vec<(String, Listener)> {
        self.read()
            .iter()
            .map(|s| (s.id.clone(), s.listener.clone()))
            .collect()
    }

    pub(crate) fn has_listeners(&self) -> bool {
        !self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Listener {
        listener(|_| async { Ok(()) })
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Highest > Priority::High);
        assert!(Priority::Low > Priority::Lowest);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_add_keeps_priority_descending_and_insertion_stable() {
        let topic = TopicListeners::default();
        topic.add("low".into(), Priority::Low, noop());
        topic.add("normal-1".into(), Priority::Normal, noop());
        topic.add("highest".into(), Priority::Highest, noop());
        topic.add("normal-2".into(), Priority::Normal, noop());

        let ids: Vec<String> = topic.snapshot().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["highest", "normal-1", "normal-2", "low"]);
    }

    #[test]
    fn test_remove_unknown_listener() {
        let topic = TopicListeners::default();
        topic.add("a".into(), Priority::Normal, noop());

        assert!(matches!(
            topic.remove("t", "missing"),
            Err(SoireeError::ListenerNotFound { .. })
        ));
        assert!(topic.remove("t", "a").is_ok());
        assert!(!topic.has_listeners());
    }
}
