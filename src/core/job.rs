//! Job definition and management.
//!
//! A [`Job`] is split into two parts:
//!
//! - a **management record** ([`JobRecord`]): identity, queue, timestamps,
//!   version and retry bookkeeping. Only the queue (at enqueue time) and the
//!   storage backend (at reservation and commit time) write to it; job code
//!   can read it but has no way to change it.
//! - a **payload** ([`JobPayload`]): the producer's parameters plus the
//!   outcome and retry/defer intent recorded by job code while it runs.
//!
//! The behaviour of a job lives in a [`JobHandler`], resolved from the
//! [`JobRegistry`](crate::JobRegistry) by job type whenever a stored job is
//! read back.
//!
//! ```text
//! Idle → Reserved → Executing → {Finished, Failed, Retried, Deferred, Indeterminate} → Persisted/Detached
//! ```
//!
//! ## Example
//! ```rust
//! use pullq::{Job, JobContext, JobHandler, Result};
//! use async_trait::async_trait;
//!
//! struct Double;
//!
//! #[async_trait]
//! impl JobHandler for Double {
//!     fn job_type(&self) -> &str {
//!         "double"
//!     }
//!
//!     async fn execute(&self, ctx: &mut JobContext<'_>) -> Result<()> {
//!         let n = ctx.parameter_as::<i64>("n")?.unwrap_or_default();
//!         ctx.finish_with_result(n * 2);
//!         Ok(())
//!     }
//! }
//!
//! let job = Job::new(Double).with_parameter("n", 5);
//! assert_eq!(job.job_type(), "double");
//! assert!(job.id().is_none());
//! assert_eq!(job.parameter("n"), Some(&serde_json::json!(5)));
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::core::JobHandler;
use crate::error::{PullqError, Result};

/// Ordered mapping of named parameter values.
pub type Parameters = serde_json::Map<String, Value>;

/// Backend-assigned job identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Queue-managed bookkeeping for a job.
///
/// Fields are crate-private: producers and job code only get read access
/// through the getters on [`Job`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobRecord {
    pub(crate) id: Option<JobId>,
    pub(crate) queue: Option<String>,
    pub(crate) created: Option<DateTime<Utc>>,
    pub(crate) schedule: Option<DateTime<Utc>>,
    pub(crate) version: i64,
    pub(crate) last_attempt: Option<DateTime<Utc>>,
    pub(crate) timeout_at: Option<DateTime<Utc>>,
    pub(crate) retry_count: u32,
}

/// Parameters and outcome intent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPayload {
    pub(crate) parameters: Parameters,
    pub(crate) failed: bool,
    pub(crate) finished_at: Option<DateTime<Utc>>,
    pub(crate) result: Option<Value>,
    pub(crate) progress: Option<f64>,
    pub(crate) retry: bool,
    pub(crate) retry_after: Option<Duration>,
    pub(crate) deferred_until: Option<DateTime<Utc>>,
}

/// A unit of work: behaviour plus queue-managed state.
#[derive(Clone)]
pub struct Job {
    handler: Arc<dyn JobHandler>,
    job_type: String,
    pub(crate) record: JobRecord,
    pub(crate) payload: JobPayload,
    /// Reservation token assigned by the backend that is tracking this job.
    pub(crate) tracking: Option<u64>,
}

impl Job {
    /// Creates a new, not yet enqueued job backed by `handler`.
    pub fn new<H>(handler: H) -> Self
    where
        H: JobHandler + 'static,
    {
        Self::from_handler(Arc::new(handler))
    }

    /// Creates a job from a shared handler instance.
    pub fn from_handler(handler: Arc<dyn JobHandler>) -> Self {
        let job_type = handler.job_type().to_string();
        Self {
            handler,
            job_type,
            record: JobRecord::default(),
            payload: JobPayload::default(),
            tracking: None,
        }
    }

    /// Builder-style parameter assignment.
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_parameter(name, value);
        self
    }

    /// Builder-style bulk parameter assignment.
    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.set_parameters(parameters);
        self
    }

    pub fn handler(&self) -> &Arc<dyn JobHandler> {
        &self.handler
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    /// Identity assigned by the backend, `None` until the job is enqueued.
    pub fn id(&self) -> Option<JobId> {
        self.record.id
    }

    /// The id for log lines and errors; `<unsaved>` before enqueue.
    pub fn display_id(&self) -> String {
        self.record
            .id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "<unsaved>".to_string())
    }

    pub fn queue_name(&self) -> Option<&str> {
        self.record.queue.as_deref()
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.record.created
    }

    /// When the job becomes eligible for reservation.
    pub fn schedule(&self) -> Option<DateTime<Utc>> {
        self.record.schedule
    }

    pub fn version(&self) -> i64 {
        self.record.version
    }

    pub fn last_attempt(&self) -> Option<DateTime<Utc>> {
        self.record.last_attempt
    }

    pub fn timeout_at(&self) -> Option<DateTime<Utc>> {
        self.record.timeout_at
    }

    pub fn retry_count(&self) -> u32 {
        self.record.retry_count
    }

    pub fn parameters(&self) -> &Parameters {
        &self.payload.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.payload.parameters.get(name)
    }

    /// Returns the named parameter, or `default` when it is missing.
    pub fn parameter_or(&self, name: &str, default: impl Into<Value>) -> Value {
        self.payload
            .parameters
            .get(name)
            .cloned()
            .unwrap_or_else(|| default.into())
    }

    /// Deserializes the named parameter into `T`.
    pub fn parameter_as<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        match self.payload.parameters.get(name) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    pub fn set_parameter(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.payload.parameters.insert(name.into(), value.into());
    }

    /// Replaces every parameter at once.
    pub fn set_parameters(&mut self, parameters: Parameters) {
        self.payload.parameters = parameters;
    }

    pub fn is_failed(&self) -> bool {
        self.payload.failed
    }

    pub fn is_finished(&self) -> bool {
        self.payload.finished_at.is_some()
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.payload.finished_at
    }

    pub fn result(&self) -> Option<&Value> {
        self.payload.result.as_ref()
    }

    pub fn progress(&self) -> Option<f64> {
        self.payload.progress
    }

    pub fn wants_retry(&self) -> bool {
        self.payload.retry
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.payload.retry_after
    }

    pub fn wants_defer(&self) -> bool {
        self.payload.deferred_until.is_some()
    }

    pub fn deferred_until(&self) -> Option<DateTime<Utc>> {
        self.payload.deferred_until
    }

    // Bookkeeping, reserved to the queue and the backends.

    pub(crate) fn prepare_enqueue(
        &mut self,
        queue: &str,
        now: DateTime<Utc>,
        schedule: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(id) = self.record.id {
            return Err(PullqError::invalid_state(format!(
                "job {} has already been enqueued",
                id
            )));
        }

        self.record.queue = Some(queue.to_string());
        self.record.created = Some(now);
        self.record.schedule = Some(schedule);
        self.record.timeout_at = None;
        self.record.last_attempt = None;
        self.record.version = 0;
        self.record.retry_count = 0;
        Ok(())
    }

    pub(crate) fn assign_id(&mut self, id: JobId) {
        self.record.id = Some(id);
    }

    pub(crate) fn mark_reserved(&mut self, now: DateTime<Utc>, timeout_at: DateTime<Utc>) {
        self.record.last_attempt = Some(now);
        self.record.timeout_at = Some(timeout_at);
        self.record.version += 1;
    }

    pub(crate) fn mark_committed(&mut self, version: i64) {
        self.record.version = version;
    }

    /// Clears outcome and intent before a new execution attempt.
    pub(crate) fn reset_outcome(&mut self) {
        self.payload.failed = false;
        self.payload.finished_at = None;
        self.payload.result = None;
        self.clear_intent();
    }

    /// Forces a plain failure: no result, no retry, no deferral.
    pub(crate) fn force_failed(&mut self) {
        self.payload.failed = true;
        self.payload.finished_at = None;
        self.payload.result = None;
        self.clear_intent();
    }

    pub(crate) fn clear_intent(&mut self) {
        self.payload.retry = false;
        self.payload.retry_after = None;
        self.payload.deferred_until = None;
    }

    /// Stages a retry: the job goes back to the eligible pool at `at`.
    pub(crate) fn stage_retry(&mut self, at: DateTime<Utc>) {
        self.payload.failed = false;
        self.record.schedule = Some(at);
        self.record.retry_count += 1;
        self.record.timeout_at = None;
    }

    /// Stages a deferral to `until` without counting a retry.
    pub(crate) fn stage_defer(&mut self, until: DateTime<Utc>) {
        self.payload.failed = false;
        self.record.schedule = Some(until);
        self.record.timeout_at = None;
    }

    /// Stages a terminal state: the reservation is released.
    pub(crate) fn stage_terminal(&mut self) {
        self.record.timeout_at = None;
    }

    // Intent, written by job code through `JobContext`.

    pub(crate) fn set_finished(&mut self, at: DateTime<Utc>) {
        self.payload.finished_at = Some(at);
    }

    pub(crate) fn set_failed(&mut self) {
        self.payload.failed = true;
    }

    pub(crate) fn set_result(&mut self, result: Value) {
        self.payload.result = Some(result);
    }

    pub(crate) fn set_progress(&mut self, progress: f64) {
        self.payload.progress = Some(progress);
    }

    pub(crate) fn set_retry(&mut self, retry: bool) {
        self.payload.retry = retry;
        if !retry {
            self.payload.retry_after = None;
        }
    }

    pub(crate) fn set_retry_after(&mut self, interval: Duration) -> Result<()> {
        if !self.payload.retry {
            return Err(PullqError::invalid_state(
                "retry interval set without requesting a retry first",
            ));
        }
        self.payload.retry_after = Some(interval);
        Ok(())
    }

    pub(crate) fn set_deferred_until(&mut self, until: DateTime<Utc>) {
        self.payload.deferred_until = Some(until);
    }

    /// Rebuilds a job from its persisted parts.
    pub(crate) fn hydrated(
        handler: Arc<dyn JobHandler>,
        record: JobRecord,
        payload: JobPayload,
    ) -> Self {
        let mut job = Self::from_handler(handler);
        job.record = record;
        job.payload = payload;
        job
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("job_type", &self.job_type)
            .field("record", &self.record)
            .field("payload", &self.payload)
            .field("tracking", &self.tracking)
            .finish()
    }
}
