//! The shared context a deployment builds once.

use std::sync::Arc;
use tracing::{debug, info};

use super::{Queue, Worker, WorkerConfig};
use crate::core::{Container, Job, JobId, SharedClock};
use crate::error::Result;
use crate::storage::Storage;

/// Name of the queue used when producers do not pick one.
pub const DEFAULT_QUEUE: &str = "_default";

/// Ties a storage backend to the service container handed to job code.
///
/// Cloning is cheap; every [`Queue`] and [`Worker`] holds a clone.
#[derive(Clone)]
pub struct QueueSystem {
    storage: Arc<dyn Storage>,
    container: Arc<Container>,
}

impl QueueSystem {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        info!("Queue system using {} storage", storage.name());
        Self {
            storage,
            container: Arc::new(Container::new()),
        }
    }

    /// Attach the service container passed to every job execution.
    pub fn with_container(mut self, container: Container) -> Self {
        debug!("Attached container with {} services", container.len());
        self.container = Arc::new(container);
        self
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    pub fn clock(&self) -> &SharedClock {
        self.storage.clock()
    }

    /// Producer handle for the named queue.
    pub fn queue(&self, name: impl Into<String>) -> Queue {
        Queue::new(self.clone(), name)
    }

    pub fn default_queue(&self) -> Queue {
        self.queue(DEFAULT_QUEUE)
    }

    /// Worker over `queues`, or over every queue when `None`.
    pub fn worker(&self, queues: Option<Vec<String>>) -> Worker {
        let config = WorkerConfig::default().queues(queues);
        Worker::new(self.clone(), config)
    }

    pub fn worker_with_config(&self, config: WorkerConfig) -> Worker {
        Worker::new(self.clone(), config)
    }

    /// Read a job by id. The returned job is a detached copy.
    pub async fn get_job_by_id(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.storage.get_by_id(id).await?)
    }

    /// Run the backend's one-time setup.
    pub async fn initial_setup(&self) -> Result<()> {
        info!("Running initial setup for {} storage", self.storage.name());
        Ok(self.storage.initial_setup().await?)
    }
}

impl std::fmt::Debug for QueueSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueSystem")
            .field("storage", &self.storage.name())
            .field("container", &self.container)
            .finish()
    }
}
