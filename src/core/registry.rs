//! Job type registry.
//!
//! Stored jobs only carry their job type name. The registry maps that name
//! back to a [`JobHandler`] so a backend can rebuild a runnable [`Job`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::core::{Job, JobHandler};
use crate::storage::StorageError;

/// Builds a handler for a registered job type.
pub type JobFactory = Arc<dyn Fn() -> Arc<dyn JobHandler> + Send + Sync>;

#[derive(Default, Clone)]
pub struct JobRegistry {
    factories: HashMap<String, JobFactory>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler type that can be built from its `Default`.
    pub fn register<H>(&mut self) -> &mut Self
    where
        H: JobHandler + Default + 'static,
    {
        let job_type = H::default().job_type().to_string();
        self.register_factory(job_type, || Arc::new(H::default()) as Arc<dyn JobHandler>)
    }

    /// Register one shared handler instance for its job type.
    pub fn register_instance<H>(&mut self, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        let handler: Arc<dyn JobHandler> = Arc::new(handler);
        let job_type = handler.job_type().to_string();
        self.register_factory(job_type, move || handler.clone())
    }

    /// Register an arbitrary factory under `job_type`.
    pub fn register_factory<F>(&mut self, job_type: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Arc<dyn JobHandler> + Send + Sync + 'static,
    {
        let job_type = job_type.into();
        tracing::debug!("Registered handler for job type: {}", job_type);
        self.factories.insert(job_type, Arc::new(factory));
        self
    }

    /// Builder-style variant of [`JobRegistry::register`].
    pub fn with<H>(mut self) -> Self
    where
        H: JobHandler + Default + 'static,
    {
        self.register::<H>();
        self
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.factories.contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Build the handler for `job_type`.
    pub fn instantiate(&self, job_type: &str) -> Result<Arc<dyn JobHandler>, StorageError> {
        let factory = self
            .factories
            .get(job_type)
            .ok_or_else(|| StorageError::hydration(job_type, "no handler registered"))?;

        let handler = factory();
        if handler.job_type() != job_type {
            return Err(StorageError::hydration(
                job_type,
                format!("factory produced a handler for [{}]", handler.job_type()),
            ));
        }
        Ok(handler)
    }

    /// Fresh job of `job_type`, with no queue state.
    pub fn create(&self, job_type: &str) -> Result<Job, StorageError> {
        Ok(Job::from_handler(self.instantiate(job_type)?))
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut job_types = self.job_types();
        job_types.sort_unstable();
        f.debug_struct("JobRegistry")
            .field("job_types", &job_types)
            .finish()
    }
}
