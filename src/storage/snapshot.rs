//! Persisted job state and reservation tracking.
//!
//! A [`JobSnapshot`] is the set of columns every backend stores for a job.
//! When a job is reserved, the backend records the snapshot it handed out in
//! its [`JobTracker`]; at commit time the job is diffed against that snapshot
//! so only changed columns are written, guarded by the snapshot's version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::core::{Job, JobId, JobPayload, JobRecord, JobRegistry, JobStatus, Parameters};
use crate::storage::StorageError;

/// Stored form of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub job_type: String,
    pub queue: String,
    pub created: DateTime<Utc>,
    pub schedule: DateTime<Utc>,
    pub failed: bool,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub progress: Option<f64>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub version: i64,
    pub parameters: Parameters,
}

/// Mutable stored columns. `id`, `job_type` and `version` are not listed:
/// the first two never change and the version is bumped by the commit itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Queue,
    Created,
    Schedule,
    Failed,
    FinishedAt,
    Result,
    Progress,
    LastAttempt,
    TimeoutAt,
    RetryCount,
    Parameters,
}

impl Column {
    pub const ALL: [Column; 11] = [
        Column::Queue,
        Column::Created,
        Column::Schedule,
        Column::Failed,
        Column::FinishedAt,
        Column::Result,
        Column::Progress,
        Column::LastAttempt,
        Column::TimeoutAt,
        Column::RetryCount,
        Column::Parameters,
    ];

    /// Column/field name used by the persistent backends.
    pub fn name(&self) -> &'static str {
        match self {
            Column::Queue => "queue",
            Column::Created => "created",
            Column::Schedule => "schedule",
            Column::Failed => "failed",
            Column::FinishedAt => "finished_at",
            Column::Result => "result",
            Column::Progress => "progress",
            Column::LastAttempt => "last_attempt",
            Column::TimeoutAt => "timeout_at",
            Column::RetryCount => "retry_count",
            Column::Parameters => "parameters",
        }
    }
}

impl JobSnapshot {
    /// Captures an enqueued job under `id`.
    pub fn capture(job: &Job, id: JobId) -> Result<Self, StorageError> {
        let queue = job
            .queue_name()
            .ok_or_else(|| StorageError::invalid_job_data("job has no queue"))?;
        let created = job
            .created()
            .ok_or_else(|| StorageError::invalid_job_data("job has no creation time"))?;
        let schedule = job
            .schedule()
            .ok_or_else(|| StorageError::invalid_job_data("job has no schedule"))?;

        Ok(Self {
            id,
            job_type: job.job_type().to_string(),
            queue: queue.to_string(),
            created,
            schedule,
            failed: job.is_failed(),
            finished_at: job.finished_at(),
            result: job.result().cloned(),
            progress: job.progress(),
            last_attempt: job.last_attempt(),
            timeout_at: job.timeout_at(),
            retry_count: job.retry_count(),
            version: job.version(),
            parameters: job.parameters().clone(),
        })
    }

    /// Captures a job that already has an identity.
    pub fn of(job: &Job) -> Result<Self, StorageError> {
        let id = job
            .id()
            .ok_or_else(|| StorageError::invalid_job_data("job has no id"))?;
        Self::capture(job, id)
    }

    pub fn status(&self, now: DateTime<Utc>) -> JobStatus {
        JobStatus::derive(
            self.schedule,
            self.failed,
            self.finished_at,
            self.last_attempt,
            self.timeout_at,
            now,
        )
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status(now).is_eligible()
    }

    /// Columns whose value differs in `newer`.
    pub fn diff(&self, newer: &JobSnapshot) -> Vec<Column> {
        Column::ALL
            .iter()
            .copied()
            .filter(|column| !self.same(newer, *column))
            .collect()
    }

    fn same(&self, other: &JobSnapshot, column: Column) -> bool {
        match column {
            Column::Queue => self.queue == other.queue,
            Column::Created => self.created == other.created,
            Column::Schedule => self.schedule == other.schedule,
            Column::Failed => self.failed == other.failed,
            Column::FinishedAt => self.finished_at == other.finished_at,
            Column::Result => self.result == other.result,
            Column::Progress => self.progress == other.progress,
            Column::LastAttempt => self.last_attempt == other.last_attempt,
            Column::TimeoutAt => self.timeout_at == other.timeout_at,
            Column::RetryCount => self.retry_count == other.retry_count,
            Column::Parameters => self.parameters == other.parameters,
        }
    }

    /// Copies the listed columns from `from`.
    pub fn apply(&mut self, from: &JobSnapshot, columns: &[Column]) {
        for column in columns {
            match column {
                Column::Queue => self.queue = from.queue.clone(),
                Column::Created => self.created = from.created,
                Column::Schedule => self.schedule = from.schedule,
                Column::Failed => self.failed = from.failed,
                Column::FinishedAt => self.finished_at = from.finished_at,
                Column::Result => self.result = from.result.clone(),
                Column::Progress => self.progress = from.progress,
                Column::LastAttempt => self.last_attempt = from.last_attempt,
                Column::TimeoutAt => self.timeout_at = from.timeout_at,
                Column::RetryCount => self.retry_count = from.retry_count,
                Column::Parameters => self.parameters = from.parameters.clone(),
            }
        }
    }

    /// Rebuilds a runnable job through `registry`.
    pub fn hydrate(self, registry: &JobRegistry) -> Result<Job, StorageError> {
        let handler = registry.instantiate(&self.job_type)?;

        let record = JobRecord {
            id: Some(self.id),
            queue: Some(self.queue),
            created: Some(self.created),
            schedule: Some(self.schedule),
            version: self.version,
            last_attempt: self.last_attempt,
            timeout_at: self.timeout_at,
            retry_count: self.retry_count,
        };
        let payload = JobPayload {
            parameters: self.parameters,
            failed: self.failed,
            finished_at: self.finished_at,
            result: self.result,
            progress: self.progress,
            ..JobPayload::default()
        };

        Ok(Job::hydrated(handler, record, payload))
    }
}

/// Snapshots of the jobs a backend has handed out and not yet detached.
#[derive(Debug, Default)]
pub struct JobTracker {
    next_token: AtomicU64,
    tracked: Mutex<HashMap<u64, JobSnapshot>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `job` as it is now.
    pub fn track(&self, job: &mut Job) -> Result<(), StorageError> {
        let snapshot = JobSnapshot::of(job)?;
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock().insert(token, snapshot);
        job.tracking = Some(token);
        Ok(())
    }

    /// The snapshot recorded for `job`.
    pub fn tracked(&self, job: &Job) -> Result<JobSnapshot, StorageError> {
        job.tracking
            .and_then(|token| self.lock().get(&token).cloned())
            .ok_or_else(|| StorageError::untracked(job.display_id()))
    }

    /// Replaces the recorded snapshot after a successful commit.
    pub fn refresh(&self, job: &Job) -> Result<(), StorageError> {
        let snapshot = JobSnapshot::of(job)?;
        let mut tracked = self.lock();
        match job.tracking.and_then(|token| tracked.get_mut(&token)) {
            Some(entry) => {
                *entry = snapshot;
                Ok(())
            }
            None => Err(StorageError::untracked(job.display_id())),
        }
    }

    /// Stops tracking `job`.
    pub fn release(&self, job: &Job) -> Result<(), StorageError> {
        job.tracking
            .and_then(|token| self.lock().remove(&token))
            .map(|_| ())
            .ok_or_else(|| StorageError::untracked(job.display_id()))
    }

    /// Whether `job` carries a token this tracker handed out.
    pub fn contains(&self, job: &Job) -> bool {
        job.tracking
            .is_some_and(|token| self.lock().contains_key(&token))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, JobSnapshot>> {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner())
    }
}
