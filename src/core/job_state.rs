//! Job status.
//!
//! Nothing stores a status column: the status of a job is derived from its
//! schedule, outcome flags and reservation timestamps at a given instant.
//! Every backend uses [`JobStatus::derive`] (or its SQL/Lua equivalent) to
//! decide eligibility, so the rules live in one place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::Job;

/// Represents the state a stored job is in at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting for its schedule time
    Scheduled {
        /// When the job becomes eligible
        at: DateTime<Utc>,
    },

    /// Eligible for reservation right now
    Pending,

    /// Held by a worker until the reservation times out
    Reserved {
        /// Start of the current attempt
        since: DateTime<Utc>,
        /// When the reservation expires and the job becomes eligible again
        until: DateTime<Utc>,
    },

    /// Completed
    Finished {
        /// Completion time
        at: DateTime<Utc>,
    },

    /// Failed permanently
    Failed,
}

impl JobStatus {
    /// Derives the status from raw fields.
    ///
    /// A reservation whose timeout has passed counts as pending again; that
    /// is how a crashed worker's job becomes reservable without any cleanup.
    pub fn derive(
        schedule: DateTime<Utc>,
        failed: bool,
        finished_at: Option<DateTime<Utc>>,
        last_attempt: Option<DateTime<Utc>>,
        timeout_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        if let Some(at) = finished_at {
            return JobStatus::Finished { at };
        }
        if failed {
            return JobStatus::Failed;
        }
        if schedule > now {
            return JobStatus::Scheduled { at: schedule };
        }
        match (last_attempt, timeout_at) {
            (Some(since), Some(until)) if until > now => JobStatus::Reserved { since, until },
            _ => JobStatus::Pending,
        }
    }

    /// Status of an in-memory job, `None` when it was never enqueued.
    pub fn of(job: &Job, now: DateTime<Utc>) -> Option<Self> {
        let schedule = job.schedule()?;
        Some(Self::derive(
            schedule,
            job.is_failed(),
            job.finished_at(),
            job.last_attempt(),
            job.timeout_at(),
            now,
        ))
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobStatus::Scheduled { .. } => "Scheduled",
            JobStatus::Pending => "Pending",
            JobStatus::Reserved { .. } => "Reserved",
            JobStatus::Finished { .. } => "Finished",
            JobStatus::Failed => "Failed",
        }
    }

    /// Whether a worker may reserve the job.
    pub fn is_eligible(&self) -> bool {
        matches!(self, JobStatus::Pending)
    }

    /// Checks if the job will never run again.
    pub fn is_final(&self) -> bool {
        matches!(self, JobStatus::Finished { .. } | JobStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_future_schedule_is_not_eligible() {
        let now = Utc::now();
        let status = JobStatus::derive(now + Duration::seconds(10), false, None, None, None, now);
        assert_eq!(
            status,
            JobStatus::Scheduled {
                at: now + Duration::seconds(10)
            }
        );
        assert!(!status.is_eligible());

        let status = JobStatus::derive(now, false, None, None, None, now);
        assert!(status.is_eligible());
    }

    #[test]
    fn test_reservation_expires_at_timeout() {
        let now = Utc::now();
        let until = now + Duration::minutes(15);

        let held = JobStatus::derive(now, false, None, Some(now), Some(until), now);
        assert_eq!(held, JobStatus::Reserved { since: now, until });

        let expired = JobStatus::derive(now, false, None, Some(now), Some(until), until);
        assert_eq!(expired, JobStatus::Pending);
    }

    #[test]
    fn test_released_reservation_is_pending() {
        let now = Utc::now();
        let status = JobStatus::derive(now, false, None, Some(now), None, now);
        assert!(status.is_eligible());
    }

    #[test]
    fn test_final_states() {
        let now = Utc::now();
        let finished = JobStatus::derive(now, false, Some(now), Some(now), None, now);
        assert!(finished.is_final());
        assert_eq!(finished.name(), "Finished");

        let failed = JobStatus::derive(now, true, None, Some(now), None, now);
        assert!(failed.is_final());
        assert!(!failed.is_eligible());
    }
}
