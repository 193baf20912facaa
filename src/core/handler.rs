//! Job behaviour and the context it runs in.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::core::{Clock, Container, Job, Parameters};
use crate::error::Result;
use crate::storage::Storage;

/// Default reservation timeout applied when a handler does not override it.
pub const DEFAULT_TIMEOUT_MINUTES: i64 = 15;

/// The behaviour behind a job type.
///
/// Handlers are stateless with respect to individual jobs: everything a run
/// needs is reached through the [`JobContext`]. Returning an error from any
/// hook marks the job as failed and discards whatever outcome it recorded.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Stable name under which the handler is registered and stored.
    fn job_type(&self) -> &str;

    /// Perform the work.
    async fn execute(&self, ctx: &mut JobContext<'_>) -> Result<()>;

    /// Runs before [`execute`](JobHandler::execute). An error skips execution.
    async fn set_up(&self, _ctx: &mut JobContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Runs after execution, whatever its result.
    async fn tear_down(&self, _ctx: &mut JobContext<'_>) -> Result<()> {
        Ok(())
    }

    /// How long a reservation stays exclusive before the job becomes eligible
    /// again.
    fn default_timeout_interval(&self) -> Duration {
        Duration::minutes(DEFAULT_TIMEOUT_MINUTES)
    }
}

/// What a running job can see and change.
pub struct JobContext<'a> {
    job: &'a mut Job,
    container: &'a Container,
    storage: &'a dyn Storage,
    clock: &'a dyn Clock,
}

impl<'a> JobContext<'a> {
    pub fn new(
        job: &'a mut Job,
        container: &'a Container,
        storage: &'a dyn Storage,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            job,
            container,
            storage,
            clock,
        }
    }

    pub fn job(&self) -> &Job {
        self.job
    }

    pub fn container(&self) -> &Container {
        self.container
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn retry_count(&self) -> u32 {
        self.job.retry_count()
    }

    pub fn parameters(&self) -> &Parameters {
        self.job.parameters()
    }

    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.job.parameter(name)
    }

    pub fn parameter_or(&self, name: &str, default: impl Into<Value>) -> Value {
        self.job.parameter_or(name, default)
    }

    pub fn parameter_as<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        self.job.parameter_as(name)
    }

    pub fn set_parameter(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.job.set_parameter(name, value);
    }

    pub fn set_parameters(&mut self, parameters: Parameters) {
        self.job.set_parameters(parameters);
    }

    /// Marks the job finished now.
    pub fn finish(&mut self) {
        let now = self.clock.now();
        self.job.set_finished(now);
    }

    pub fn finish_with_result(&mut self, result: impl Into<Value>) {
        self.finish();
        self.job.set_result(result.into());
    }

    pub fn fail(&mut self) {
        self.job.set_failed();
    }

    pub fn fail_with_result(&mut self, result: impl Into<Value>) {
        self.fail();
        self.job.set_result(result.into());
    }

    /// Asks for the job to go back to the queue once this run ends.
    pub fn then_retry(&mut self) {
        self.job.set_retry(true);
    }

    pub fn without_retry(&mut self) {
        self.job.set_retry(false);
    }

    /// Delays a requested retry. Fails unless [`then_retry`](Self::then_retry)
    /// was called first.
    pub fn retry_after(&mut self, interval: Duration) -> Result<()> {
        self.job.set_retry_after(interval)
    }

    /// Postpones the job to `until` without counting a retry.
    pub fn defer_until(&mut self, until: DateTime<Utc>) {
        self.job.set_deferred_until(until);
    }

    pub fn defer_for(&mut self, interval: Duration) {
        let until = self.clock.now() + interval;
        self.job.set_deferred_until(until);
    }

    /// Records progress, clamped to `0..=100`, and pushes it to the backend.
    ///
    /// Reporting is best effort: a backend failure is logged and the value is
    /// still committed with the job's final state.
    pub async fn report_progress(&mut self, progress: f64) {
        let progress = clamp_progress(progress);
        self.job.set_progress(progress);

        if let Err(e) = self.storage.report_progress(self.job, progress).await {
            warn!("Failed to report progress for job {:?}: {}", self.job.id(), e);
        }
    }
}

pub(crate) fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 100.0)
    }
}
