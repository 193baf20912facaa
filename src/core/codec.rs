//! Wire representation of a job.
//!
//! List-oriented backends move jobs across a byte-stream boundary as a
//! [`JobEnvelope`]: job type, `created` and `schedule` as epoch seconds, and
//! the parameter mapping. Outcome and reservation state never travel in the
//! envelope.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{Job, JobRegistry, Parameters};
use crate::storage::StorageError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    #[serde(rename = "type")]
    pub job_type: String,
    pub created: i64,
    pub schedule: i64,
    #[serde(default)]
    pub parameters: Parameters,
}

impl JobEnvelope {
    /// Captures the wire-relevant part of an enqueued job.
    pub fn from_job(job: &Job) -> Result<Self, StorageError> {
        let created = job
            .created()
            .ok_or_else(|| StorageError::invalid_job_data("job has no creation time"))?;
        let schedule = job
            .schedule()
            .ok_or_else(|| StorageError::invalid_job_data("job has no schedule"))?;

        Ok(Self {
            job_type: job.job_type().to_string(),
            created: created.timestamp(),
            schedule: schedule.timestamp(),
            parameters: job.parameters().clone(),
        })
    }

    pub fn encode(&self) -> Result<String, StorageError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, StorageError> {
        serde_json::from_str(raw).map_err(|e| {
            StorageError::serialization_with_source("malformed job envelope", Box::new(e))
        })
    }

    pub fn created_at(&self) -> Result<DateTime<Utc>, StorageError> {
        epoch_seconds(self.created)
    }

    pub fn scheduled_at(&self) -> Result<DateTime<Utc>, StorageError> {
        epoch_seconds(self.schedule)
    }

    /// Rebuilds a job through `registry`. The result has no identity and no
    /// reservation state.
    pub fn into_job(self, registry: &JobRegistry) -> Result<Job, StorageError> {
        let created = self.created_at()?;
        let schedule = self.scheduled_at()?;

        let mut job = registry.create(&self.job_type)?;
        job.record.created = Some(created);
        job.record.schedule = Some(schedule);
        job.payload.parameters = self.parameters;
        Ok(job)
    }
}

fn epoch_seconds(secs: i64) -> Result<DateTime<Utc>, StorageError> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| StorageError::invalid_job_data(format!("timestamp out of range: {}", secs)))
}

/// Encodes a job straight to its wire string.
pub fn encode(job: &Job) -> Result<String, StorageError> {
    JobEnvelope::from_job(job)?.encode()
}

/// Decodes a wire string into a job.
pub fn decode(raw: &str, registry: &JobRegistry) -> Result<Job, StorageError> {
    JobEnvelope::decode(raw)?.into_job(registry)
}
