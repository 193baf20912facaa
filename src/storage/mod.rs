use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::core::{Job, JobId, JobRegistry, SharedClock};

pub mod config;
pub mod error;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;
pub mod settings;
pub mod snapshot;

#[cfg(feature = "postgres")]
pub use config::PostgresConfig;
#[cfg(feature = "redis")]
pub use config::RedisConfig;
pub use config::{MemoryConfig, StorageConfig};
pub use error::StorageError;
pub use memory::MemoryStorage;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStorage;
#[cfg(feature = "redis")]
pub use redis::RedisStorage;
pub use settings::{Backend, Settings};
pub use snapshot::{Column, JobSnapshot, JobTracker};

/// Backend contract for job persistence and reservation.
///
/// Every backend implements the same optimistic-concurrency protocol:
///
/// - **Reservation** picks one eligible job, then claims it with a
///   compare-and-swap on its `version`. Claiming sets `last_attempt`,
///   `timeout_at` (from the handler's timeout interval) and bumps the version.
///   A lost race just means trying again; a caller never sees a job another
///   caller also holds.
/// - **Commit** ([`persist_state`](Storage::persist_state)) writes only the
///   columns that changed since the job was reserved, conditional on the
///   version still being the one handed out. Zero affected rows is a
///   [`StorageError::LockConflict`].
/// - **Tracking**: a backend remembers what it handed out until
///   [`detach`](Storage::detach). Persisting or detaching a job it does not
///   track is a [`StorageError::UntrackedJob`].
///
/// A job is eligible when its schedule has passed, it is neither failed nor
/// finished, and it is not held by a live reservation. An expired
/// reservation makes a job eligible again without any cleanup step.
///
/// ```text
/// Worker A ──┐
///            ├── reserve() ──→ Gets Job #123 (version 3 → 4)
/// Worker B ──┘             ──→ CAS on #123 fails, gets Job #124 instead
/// ```
///
/// ## Example
/// ```rust
/// use pullq::{Job, JobContext, JobHandler, JobRegistry, MemoryStorage, Result, Storage};
/// use async_trait::async_trait;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// #[derive(Default)]
/// struct Ping;
///
/// #[async_trait]
/// impl JobHandler for Ping {
///     fn job_type(&self) -> &str {
///         "ping"
///     }
///
///     async fn execute(&self, ctx: &mut JobContext<'_>) -> Result<()> {
///         ctx.finish();
///         Ok(())
///     }
/// }
///
/// # tokio_test::block_on(async {
/// let registry = Arc::new(JobRegistry::new().with::<Ping>());
/// let storage = MemoryStorage::new(registry);
///
/// let queue = pullq::QueueSystem::new(Arc::new(storage)).queue("default");
/// queue.enqueue(&mut Job::new(Ping)).await.unwrap();
///
/// let storage = queue.system().storage();
/// let job = storage.reserve(None, false, Duration::ZERO).await.unwrap().unwrap();
/// assert_eq!(job.version(), 1);
/// assert!(job.timeout_at().is_some());
/// # });
/// ```
#[async_trait]
pub trait Storage: Send + Sync {
    /// Short backend name, e.g. `"memory"`.
    fn name(&self) -> &'static str;

    /// The time source all eligibility decisions use.
    fn clock(&self) -> &SharedClock;

    /// Number of jobs in `queue` that are eligible right now.
    async fn count_pending(&self, queue: &str) -> Result<usize, StorageError>;

    /// Store a new job and return the identity assigned to it.
    ///
    /// The job must already carry its queue name, creation time and
    /// schedule; [`Queue::enqueue`](crate::Queue::enqueue) takes care of that.
    async fn enqueue(&self, queue: &str, job: &Job) -> Result<JobId, StorageError>;

    /// Reserve one eligible job from `queues` (all queues when `None`).
    ///
    /// Without `blocking`, returns `None` immediately if nothing is eligible.
    /// With `blocking`, waits up to `timeout` for a job; a zero timeout waits
    /// indefinitely. The returned job is tracked until
    /// [`detach`](Storage::detach).
    async fn reserve(
        &self,
        queues: Option<&[String]>,
        blocking: bool,
        timeout: Duration,
    ) -> Result<Option<Job>, StorageError>;

    /// Commit the changed state of a tracked job under its version.
    ///
    /// On success the job's version is bumped and the tracked snapshot is
    /// refreshed, so the job can be persisted again.
    async fn persist_state(&self, job: &mut Job) -> Result<(), StorageError>;

    /// Stop tracking a job.
    async fn detach(&self, job: &Job) -> Result<(), StorageError>;

    /// Whether `job` was handed out by this storage and not yet detached.
    fn is_tracked(&self, job: &Job) -> bool;

    /// Read a job by identity. The result is not tracked.
    async fn get_by_id(&self, id: JobId) -> Result<Option<Job>, StorageError>;

    /// Write a progress value immediately, outside the version protocol.
    async fn report_progress(&self, job: &Job, progress: f64) -> Result<(), StorageError>;

    /// Idempotent one-time setup such as schema creation.
    async fn initial_setup(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Queue filter, treating an empty list like "all queues".
pub(crate) fn queue_filter(queues: Option<&[String]>) -> Option<&[String]> {
    queues.filter(|q| !q.is_empty())
}

/// Bookkeeping for a blocking reservation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReserveDeadline {
    deadline: Option<Instant>,
    poll_interval: Duration,
}

impl ReserveDeadline {
    pub(crate) fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            deadline: (!timeout.is_zero()).then(|| Instant::now() + timeout),
            poll_interval,
        }
    }

    /// How long to wait before the next attempt, or `None` once the timeout
    /// has elapsed.
    pub(crate) fn next_wait(&self) -> Option<Duration> {
        match self.deadline {
            None => Some(self.poll_interval),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    None
                } else {
                    Some(self.poll_interval.min(deadline - now))
                }
            }
        }
    }
}

/// Storage instance that can hold any storage implementation
pub enum StorageInstance {
    /// Memory storage instance
    Memory(MemoryStorage),
    /// Redis storage instance
    #[cfg(feature = "redis")]
    Redis(RedisStorage),
    /// PostgreSQL storage instance
    #[cfg(feature = "postgres")]
    Postgres(PostgresStorage),
}

impl StorageInstance {
    /// Create a storage instance from configuration
    ///
    /// ```rust
    /// use pullq::storage::{MemoryConfig, StorageConfig, StorageInstance, Storage};
    /// use pullq::JobRegistry;
    /// use std::sync::Arc;
    ///
    /// # tokio_test::block_on(async {
    /// let config = StorageConfig::Memory(MemoryConfig::default());
    /// let storage = StorageInstance::from_config(config, Arc::new(JobRegistry::new()))
    ///     .await
    ///     .unwrap();
    /// assert_eq!(storage.name(), "memory");
    /// # });
    /// ```
    pub async fn from_config(
        config: StorageConfig,
        registry: Arc<JobRegistry>,
    ) -> Result<Self, StorageError> {
        match config {
            StorageConfig::Memory(memory_config) => Ok(StorageInstance::Memory(
                MemoryStorage::with_config(registry, memory_config),
            )),
            #[cfg(feature = "redis")]
            StorageConfig::Redis(redis_config) => {
                let redis_storage = RedisStorage::with_config(registry, redis_config).await?;
                Ok(StorageInstance::Redis(redis_storage))
            }
            #[cfg(feature = "postgres")]
            StorageConfig::Postgres(postgres_config) => {
                let postgres_storage = PostgresStorage::new(registry, postgres_config).await?;
                Ok(StorageInstance::Postgres(postgres_storage))
            }
        }
    }

    /// Create a memory storage instance with default configuration
    pub fn memory(registry: Arc<JobRegistry>) -> Self {
        StorageInstance::Memory(MemoryStorage::new(registry))
    }

    #[cfg(feature = "redis")]
    pub async fn redis(
        registry: Arc<JobRegistry>,
        config: RedisConfig,
    ) -> Result<Self, StorageError> {
        Ok(StorageInstance::Redis(
            RedisStorage::with_config(registry, config).await?,
        ))
    }

    #[cfg(feature = "postgres")]
    pub async fn postgres(
        registry: Arc<JobRegistry>,
        config: PostgresConfig,
    ) -> Result<Self, StorageError> {
        Ok(StorageInstance::Postgres(
            PostgresStorage::new(registry, config).await?,
        ))
    }

    fn inner(&self) -> &dyn Storage {
        match self {
            StorageInstance::Memory(storage) => storage,
            #[cfg(feature = "redis")]
            StorageInstance::Redis(storage) => storage,
            #[cfg(feature = "postgres")]
            StorageInstance::Postgres(storage) => storage,
        }
    }
}

#[async_trait]
impl Storage for StorageInstance {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn clock(&self) -> &SharedClock {
        self.inner().clock()
    }

    async fn count_pending(&self, queue: &str) -> Result<usize, StorageError> {
        self.inner().count_pending(queue).await
    }

    async fn enqueue(&self, queue: &str, job: &Job) -> Result<JobId, StorageError> {
        self.inner().enqueue(queue, job).await
    }

    async fn reserve(
        &self,
        queues: Option<&[String]>,
        blocking: bool,
        timeout: Duration,
    ) -> Result<Option<Job>, StorageError> {
        self.inner().reserve(queues, blocking, timeout).await
    }

    async fn persist_state(&self, job: &mut Job) -> Result<(), StorageError> {
        self.inner().persist_state(job).await
    }

    async fn detach(&self, job: &Job) -> Result<(), StorageError> {
        self.inner().detach(job).await
    }

    fn is_tracked(&self, job: &Job) -> bool {
        self.inner().is_tracked(job)
    }

    async fn get_by_id(&self, id: JobId) -> Result<Option<Job>, StorageError> {
        self.inner().get_by_id(id).await
    }

    async fn report_progress(&self, job: &Job, progress: f64) -> Result<(), StorageError> {
        self.inner().report_progress(job, progress).await
    }

    async fn initial_setup(&self) -> Result<(), StorageError> {
        self.inner().initial_setup().await
    }
}
