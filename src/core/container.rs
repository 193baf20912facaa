//! Service container handed to job code.
//!
//! The queue never looks inside the container; it is built once by the
//! application, attached to the [`QueueSystem`](crate::QueueSystem) and passed
//! unchanged into every [`JobHandler::execute`](crate::JobHandler::execute).

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Type-keyed service locator.
#[derive(Default, Clone)]
pub struct Container {
    services: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service, replacing any previous service of the same type.
    pub fn insert<T>(&mut self, service: T) -> &mut Self
    where
        T: Any + Send + Sync,
    {
        self.services.insert(TypeId::of::<T>(), Arc::new(service));
        self
    }

    /// Builder-style variant of [`Container::insert`].
    pub fn with<T>(mut self, service: T) -> Self
    where
        T: Any + Send + Sync,
    {
        self.insert(service);
        self
    }

    /// Look up a service by type.
    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.services
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|service| service.downcast::<T>().ok())
    }

    pub fn contains<T>(&self) -> bool
    where
        T: Any + Send + Sync,
    {
        self.services.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("services", &self.services.len())
            .finish()
    }
}
