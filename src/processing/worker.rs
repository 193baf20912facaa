//! Worker: reserve, run, commit.
//!
//! A run always ends in exactly one [`Outcome`], chosen from what the job
//! recorded, in this order of precedence:
//!
//! 1. finished with a result
//! 2. finished
//! 3. deferred
//! 4. retried
//! 5. failed with a result
//! 6. failed
//! 7. indeterminate (nothing recorded; committed as failed)
//!
//! An error from set-up, execution or tear-down forces a plain failure and
//! drops any recorded result or intent. The error itself stays inside
//! [`Worker::run`]; only storage errors reach the caller.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::QueueSystem;
use crate::core::{Clock, Job, JobContext};
use crate::error::{PullqError, Result};
use crate::storage::StorageError;

/// Configuration for worker instances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Unique identifier for the worker
    pub worker_id: String,
    /// Queues that this worker will process (`None` = all queues)
    pub queues: Option<Vec<String>>,
    /// How long one blocking reservation in [`Worker::work`] waits
    pub reserve_timeout: Duration,
    /// Pause after a lock conflict before reserving again
    pub idle_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: uuid::Uuid::new_v4().to_string(),
            queues: None,
            reserve_timeout: Duration::from_secs(5),
            idle_backoff: Duration::from_millis(100),
        }
    }
}

impl WorkerConfig {
    /// Create a new worker configuration with the specified worker ID
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    /// Set the queues this worker will process
    pub fn queues(mut self, queues: Option<Vec<String>>) -> Self {
        self.queues = queues;
        self
    }

    /// Set the blocking reservation timeout. Zero waits forever, which also
    /// means a shutdown request is only noticed once a job arrives.
    pub fn reserve_timeout(mut self, timeout: Duration) -> Self {
        self.reserve_timeout = timeout;
        self
    }

    pub fn idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }
}

/// Result of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    FinishedWithResult,
    Finished,
    /// Rescheduled without counting a retry
    Deferred { until: DateTime<Utc> },
    /// Rescheduled with the retry count incremented
    Retried { at: DateTime<Utc> },
    FailedWithResult,
    Failed,
    /// The job recorded no outcome; committed as failed
    Indeterminate,
}

impl Outcome {
    pub fn name(&self) -> &'static str {
        match self {
            Outcome::FinishedWithResult => "FinishedWithResult",
            Outcome::Finished => "Finished",
            Outcome::Deferred { .. } => "Deferred",
            Outcome::Retried { .. } => "Retried",
            Outcome::FailedWithResult => "FailedWithResult",
            Outcome::Failed => "Failed",
            Outcome::Indeterminate => "Indeterminate",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::FinishedWithResult | Outcome::Finished)
    }

    /// Whether the job will be picked up again later.
    pub fn is_rescheduled(&self) -> bool {
        matches!(self, Outcome::Deferred { .. } | Outcome::Retried { .. })
    }
}

/// Picks the outcome for what `job` recorded.
pub(crate) fn classify(job: &Job, now: DateTime<Utc>) -> Outcome {
    if job.is_finished() {
        return if job.result().is_some() {
            Outcome::FinishedWithResult
        } else {
            Outcome::Finished
        };
    }
    if let Some(until) = job.deferred_until() {
        return Outcome::Deferred { until };
    }
    if job.wants_retry() {
        let delay = job.retry_after().unwrap_or_else(ChronoDuration::zero);
        return Outcome::Retried { at: now + delay };
    }
    if job.is_failed() {
        return if job.result().is_some() {
            Outcome::FailedWithResult
        } else {
            Outcome::Failed
        };
    }
    Outcome::Indeterminate
}

/// Pulls jobs from storage and runs them.
///
/// Clones share the shutdown flag, so one clone can stop a loop running on
/// another task.
#[derive(Debug, Clone)]
pub struct Worker {
    system: QueueSystem,
    config: WorkerConfig,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(system: QueueSystem, config: WorkerConfig) -> Self {
        Self {
            system,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Reserve the next job from this worker's queues.
    pub async fn reserve(&self, blocking: bool, timeout: Duration) -> Result<Option<Job>> {
        debug!(
            "Worker {} reserving (blocking: {}, timeout: {:?})",
            self.config.worker_id, blocking, timeout
        );

        let job = self
            .system
            .storage()
            .reserve(self.config.queues.as_deref(), blocking, timeout)
            .await?;

        if let Some(job) = &job {
            info!(
                "Worker {} reserved job {} ({})",
                self.config.worker_id,
                job.display_id(),
                job.job_type()
            );
        }
        Ok(job)
    }

    /// Run a reserved job and commit its outcome.
    ///
    /// A job this worker's storage does not track is rejected with
    /// [`PullqError::UntrackedJob`] before any of its code runs. Otherwise
    /// the job is detached from storage afterwards, whether or not the
    /// commit succeeded.
    pub async fn run(&self, job: &mut Job) -> Result<Outcome> {
        let storage = self.system.storage().clone();
        let job_id = job.display_id();

        if !storage.is_tracked(job) {
            warn!(
                "Worker {} refused to run job {}: it was not reserved here",
                self.config.worker_id, job_id
            );
            return Err(StorageError::untracked(job_id).into());
        }

        let container = self.system.container().clone();
        let clock = self.system.clock().clone();
        let handler = job.handler().clone();

        job.reset_outcome();
        info!("Running job {} ({})", job_id, job.job_type());

        let (execution, tear_down) = {
            let mut ctx = JobContext::new(job, &container, storage.as_ref(), clock.as_ref());
            let execution = match handler.set_up(&mut ctx).await {
                Ok(()) => handler.execute(&mut ctx).await,
                Err(e) => Err(e),
            };
            let tear_down = handler.tear_down(&mut ctx).await;
            (execution, tear_down)
        };

        if let Err(e) = &execution {
            error!("Job {} raised an error: {}", job_id, e);
            job.force_failed();
        }
        if let Err(e) = &tear_down {
            warn!("Tear-down of job {} failed: {}", job_id, e);
            job.force_failed();
        }

        let outcome = classify(job, clock.now());
        match outcome {
            Outcome::FinishedWithResult => {
                info!("Job {} finished with result", job_id);
                job.stage_terminal();
            }
            Outcome::Finished => {
                info!("Job {} finished", job_id);
                job.stage_terminal();
            }
            Outcome::Deferred { until } => {
                info!("Job {} deferred until {}", job_id, until);
                job.stage_defer(until);
            }
            Outcome::Retried { at } => {
                info!(
                    "Job {} will be retried at {} (retry {})",
                    job_id,
                    at,
                    job.retry_count() + 1
                );
                job.stage_retry(at);
            }
            Outcome::FailedWithResult => {
                info!("Job {} failed with result", job_id);
                job.stage_terminal();
            }
            Outcome::Failed => {
                info!("Job {} failed", job_id);
                job.stage_terminal();
            }
            Outcome::Indeterminate => {
                error!(
                    "Job {} ended without recording an outcome, marking it failed",
                    job_id
                );
                job.force_failed();
                job.stage_terminal();
            }
        }

        let committed = storage.persist_state(job).await;
        let detached = storage.detach(job).await;

        if let Err(e) = committed {
            warn!("Failed to commit job {}: {}", job_id, e);
            return Err(e.into());
        }
        detached?;

        Ok(outcome)
    }

    /// Reserve and run jobs until [`shutdown`](Self::shutdown) is requested.
    ///
    /// Returns how many jobs were run. A lock conflict on commit is logged
    /// and the loop continues; any other storage error ends the loop.
    pub async fn work(&self) -> Result<usize> {
        info!("Worker {} started", self.config.worker_id);
        let mut processed = 0;

        while !self.is_shutting_down() {
            let Some(mut job) = self.reserve(true, self.config.reserve_timeout).await? else {
                continue;
            };

            match self.run(&mut job).await {
                Ok(_) => processed += 1,
                Err(PullqError::LockConflict { job_id, version }) => {
                    processed += 1;
                    warn!(
                        "Worker {} lost job {} (version {}) to another reservation",
                        self.config.worker_id, job_id, version
                    );
                    tokio::time::sleep(self.config.idle_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "Worker {} stopped after {} jobs",
            self.config.worker_id, processed
        );
        Ok(processed)
    }

    /// Ask [`work`](Self::work) to stop after the current job.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}
