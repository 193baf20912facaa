//! Producer side of a named queue.

use chrono::{DateTime, Utc};
use tracing::info;

use super::QueueSystem;
use crate::core::{Clock, Job, JobId};
use crate::error::Result;

/// A named queue. Producers add jobs here; workers pull them through storage.
#[derive(Debug, Clone)]
pub struct Queue {
    system: QueueSystem,
    name: String,
}

impl Queue {
    pub(crate) fn new(system: QueueSystem, name: impl Into<String>) -> Self {
        Self {
            system,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn system(&self) -> &QueueSystem {
        &self.system
    }

    /// Add a job that is eligible right away.
    ///
    /// The job gets its queue name, creation time, schedule and a zero
    /// version, and the backend-assigned id is written back into it.
    /// Enqueueing a job that already has an id is rejected.
    pub async fn enqueue(&self, job: &mut Job) -> Result<JobId> {
        let now = self.system.clock().now();
        self.push(job, now, now).await
    }

    /// Add a job that becomes eligible at `at`.
    pub async fn schedule(&self, job: &mut Job, at: DateTime<Utc>) -> Result<JobId> {
        let now = self.system.clock().now();
        self.push(job, now, at).await
    }

    /// Number of jobs in this queue eligible right now.
    pub async fn count(&self) -> Result<usize> {
        Ok(self.system.storage().count_pending(&self.name).await?)
    }

    async fn push(
        &self,
        job: &mut Job,
        now: DateTime<Utc>,
        schedule: DateTime<Utc>,
    ) -> Result<JobId> {
        job.prepare_enqueue(&self.name, now, schedule)?;
        let id = self.system.storage().enqueue(&self.name, job).await?;
        job.assign_id(id);

        if schedule > now {
            info!(
                "Scheduled job {} ({}) on queue {} for {}",
                id,
                job.job_type(),
                self.name,
                schedule
            );
        } else {
            info!("Enqueued job {} ({}) on queue {}", id, job.job_type(), self.name);
        }
        Ok(id)
    }
}
