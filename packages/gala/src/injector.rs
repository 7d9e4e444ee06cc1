//! Dependency injection scope handed to listeners.

use std::any::{type_name, Any, TypeId};
use std::sync::Arc;

use dashmap::DashMap;

use crate::context::Context;
use crate::envelope::{Envelope, EventId};
use crate::error::{GalaError, Result};
use crate::topic::TopicName;

/// Type-keyed service map shared by every dispatch.
#[derive(Clone, Default)]
pub struct Injector {
    services: Arc<DashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl Injector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provide a service, replacing any previous value of the same type.
    pub fn provide<T: Send + Sync + 'static>(&self, service: T) {
        self.provide_arc(Arc::new(service));
    }

    pub fn provide_arc<T: Send + Sync + 'static>(&self, service: Arc<T>) {
        self.services.insert(TypeId::of::<T>(), service);
    }

    pub fn resolve<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.services
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.value().clone().downcast::<T>().ok())
    }

    pub fn must_resolve<T: Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        self.resolve::<T>().ok_or(GalaError::DependencyNotProvided {
            type_name: type_name::<T>(),
        })
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl std::fmt::Debug for Injector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Injector")
            .field("services", &self.services.len())
            .finish()
    }
}

/// What a listener receives alongside its payload.
#[derive(Clone, Debug)]
pub struct HandlerContext {
    /// Caller context with the envelope's snapshot restored into it.
    pub context: Context,
    pub envelope: Arc<Envelope>,
    pub injector: Injector,
}

impl HandlerContext {
    pub fn event_id(&self) -> &EventId {
        &self.envelope.id
    }

    pub fn topic(&self) -> &TopicName {
        &self.envelope.topic
    }

    pub fn resolve<T: Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        self.injector.must_resolve::<T>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Mailer {
        from: &'static str,
    }

    #[test]
    fn test_provide_and_resolve() {
        let injector = Injector::new();
        injector.provide(Mailer { from: "noreply" });

        assert_eq!(injector.resolve::<Mailer>().unwrap().from, "noreply");
        assert_eq!(injector.len(), 1);
    }

    #[test]
    fn test_must_resolve_names_missing_type() {
        let err = Injector::new().must_resolve::<Mailer>().unwrap_err();
        match err {
            GalaError::DependencyNotProvided { type_name } => assert!(type_name.ends_with("Mailer")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_clones_share_services() {
        let injector = Injector::new();
        let clone = injector.clone();
        clone.provide(7u32);

        assert_eq!(*injector.resolve::<u32>().unwrap(), 7);
    }
}
