use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::snapshot::{JobSnapshot, JobTracker};
use super::{queue_filter, MemoryConfig, ReserveDeadline, Storage, StorageError};
use crate::core::handler::clamp_progress;
use crate::core::{
    system_clock, Clock, Job, JobId, JobRegistry, SharedClock, DEFAULT_TIMEOUT_MINUTES,
};

/// In-memory storage implementation for jobs
///
/// Jobs live in an ordered map keyed by id, so reservation order is insertion
/// order. The same optimistic protocol as the persistent backends is applied:
/// a reservation reads a candidate, then claims it only if its version has
/// not moved. Blocking reservations wake up as soon as a job is enqueued or
/// committed.
#[derive(Debug)]
pub struct MemoryStorage {
    jobs: RwLock<BTreeMap<JobId, JobSnapshot>>,
    next_id: AtomicI64,
    tracker: JobTracker,
    registry: Arc<JobRegistry>,
    clock: SharedClock,
    notify: Notify,
    config: MemoryConfig,
}

impl MemoryStorage {
    /// Create a new memory storage with default configuration
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self::with_config(registry, MemoryConfig::default())
    }

    /// Create a new memory storage with the specified configuration
    pub fn with_config(registry: Arc<JobRegistry>, config: MemoryConfig) -> Self {
        Self {
            jobs: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(0),
            tracker: JobTracker::new(),
            registry,
            clock: system_clock(),
            notify: Notify::new(),
            config,
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Get the number of jobs currently stored
    pub fn len(&self) -> usize {
        self.read_jobs().map(|jobs| jobs.len()).unwrap_or(0)
    }

    /// Check if the storage is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of jobs handed out and not yet detached.
    pub fn tracked(&self) -> usize {
        self.tracker.len()
    }

    /// Raw stored state of a job.
    pub fn snapshot(&self, id: JobId) -> Result<Option<JobSnapshot>, StorageError> {
        Ok(self.read_jobs()?.get(&id).cloned())
    }

    fn read_jobs(&self) -> Result<RwLockReadGuard<'_, BTreeMap<JobId, JobSnapshot>>, StorageError> {
        self.jobs
            .read()
            .map_err(|e| StorageError::operation_failed("read_jobs", e.to_string()))
    }

    fn write_jobs(
        &self,
    ) -> Result<RwLockWriteGuard<'_, BTreeMap<JobId, JobSnapshot>>, StorageError> {
        self.jobs
            .write()
            .map_err(|e| StorageError::operation_failed("write_jobs", e.to_string()))
    }

    fn is_at_capacity(&self, stored: usize) -> bool {
        self.config.max_jobs.is_some_and(|max_jobs| stored >= max_jobs)
    }

    /// Claims a job that cannot be hydrated for the default timeout, so it
    /// stops shadowing the jobs behind it until its lease runs out.
    fn lease_aside(&self, candidate: &JobSnapshot, now: DateTime<Utc>) -> Result<(), StorageError> {
        let mut jobs = self.write_jobs()?;
        if let Some(stored) = jobs.get_mut(&candidate.id) {
            if stored.version == candidate.version {
                stored.last_attempt = Some(now);
                stored.timeout_at = Some(now + ChronoDuration::minutes(DEFAULT_TIMEOUT_MINUTES));
                stored.version += 1;
                warn!(
                    "Job {} has unknown type {}, leased aside until {:?}",
                    candidate.id, candidate.job_type, stored.timeout_at
                );
            }
        }
        Ok(())
    }

    /// One non-blocking reservation attempt.
    fn try_reserve(&self, queues: Option<&[String]>) -> Result<Option<Job>, StorageError> {
        loop {
            let now = self.clock.now();
            let candidate = {
                let jobs = self.read_jobs()?;
                jobs.values()
                    .find(|snapshot| {
                        queues.map_or(true, |q| q.contains(&snapshot.queue))
                            && snapshot.is_eligible(now)
                    })
                    .cloned()
            };

            let Some(candidate) = candidate else {
                return Ok(None);
            };

            let mut job = match candidate.clone().hydrate(&self.registry) {
                Ok(job) => job,
                Err(e) => {
                    self.lease_aside(&candidate, now)?;
                    return Err(e);
                }
            };
            let timeout_at = now + job.handler().default_timeout_interval();

            let claimed = {
                let mut jobs = self.write_jobs()?;
                match jobs.get_mut(&candidate.id) {
                    Some(stored) if stored.version == candidate.version => {
                        stored.last_attempt = Some(now);
                        stored.timeout_at = Some(timeout_at);
                        stored.version += 1;
                        true
                    }
                    _ => false,
                }
            };

            if claimed {
                job.mark_reserved(now, timeout_at);
                self.tracker.track(&mut job)?;
                debug!(
                    "Reserved job {} (version {})",
                    candidate.id,
                    job.version()
                );
                return Ok(Some(job));
            }

            debug!(
                "Job {} changed before it could be claimed, retrying",
                candidate.id
            );
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn clock(&self) -> &SharedClock {
        &self.clock
    }

    async fn count_pending(&self, queue: &str) -> Result<usize, StorageError> {
        let now = self.clock.now();
        let jobs = self.read_jobs()?;
        Ok(jobs
            .values()
            .filter(|snapshot| snapshot.queue == queue && snapshot.is_eligible(now))
            .count())
    }

    async fn enqueue(&self, queue: &str, job: &Job) -> Result<JobId, StorageError> {
        let id = {
            let mut jobs = self.write_jobs()?;
            if self.is_at_capacity(jobs.len()) {
                return Err(StorageError::capacity_exceeded(format!(
                    "Memory storage is at capacity ({} jobs)",
                    jobs.len()
                )));
            }

            let id = JobId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
            let mut snapshot = JobSnapshot::capture(job, id)?;
            snapshot.queue = queue.to_string();
            jobs.insert(id, snapshot);
            id
        };

        self.notify.notify_waiters();
        Ok(id)
    }

    async fn reserve(
        &self,
        queues: Option<&[String]>,
        blocking: bool,
        timeout: Duration,
    ) -> Result<Option<Job>, StorageError> {
        let queues = queue_filter(queues);
        if !blocking {
            return self.try_reserve(queues);
        }

        let deadline = ReserveDeadline::new(timeout, self.config.poll_interval);
        loop {
            // Register interest before looking, so an enqueue in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.try_reserve(queues)? {
                return Ok(Some(job));
            }

            let Some(wait) = deadline.next_wait() else {
                return Ok(None);
            };
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    async fn persist_state(&self, job: &mut Job) -> Result<(), StorageError> {
        let before = self.tracker.tracked(job)?;
        let current = JobSnapshot::of(job)?;
        let changed = before.diff(&current);

        {
            let mut jobs = self.write_jobs()?;
            let stored = jobs
                .get_mut(&before.id)
                .ok_or_else(|| StorageError::job_not_found(before.id))?;

            if stored.version != before.version {
                warn!(
                    "Lock conflict on job {}: expected version {}, found {}",
                    before.id, before.version, stored.version
                );
                return Err(StorageError::lock_conflict(before.id, before.version));
            }

            stored.apply(&current, &changed);
            stored.version += 1;
        }

        job.mark_committed(before.version + 1);
        self.tracker.refresh(job)?;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn detach(&self, job: &Job) -> Result<(), StorageError> {
        self.tracker.release(job)
    }

    fn is_tracked(&self, job: &Job) -> bool {
        self.tracker.contains(job)
    }

    async fn get_by_id(&self, id: JobId) -> Result<Option<Job>, StorageError> {
        let snapshot = self.read_jobs()?.get(&id).cloned();
        snapshot
            .map(|snapshot| snapshot.hydrate(&self.registry))
            .transpose()
    }

    async fn report_progress(&self, job: &Job, progress: f64) -> Result<(), StorageError> {
        let id = job
            .id()
            .ok_or_else(|| StorageError::invalid_job_data("job has no id"))?;
        let mut jobs = self.write_jobs()?;
        let stored = jobs
            .get_mut(&id)
            .ok_or_else(|| StorageError::job_not_found(id))?;
        stored.progress = Some(clamp_progress(progress));
        Ok(())
    }
}
