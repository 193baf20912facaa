//! Core types for pullq.
//!
//! This module contains the job model, the handler contract job code
//! implements, the registry used to rebuild stored jobs, and the clock and
//! service container shared by everything else.

pub mod clock;
pub mod codec;
pub mod container;
pub mod handler;
pub mod job;
pub mod job_state;
pub mod registry;

pub use clock::{system_clock, Clock, MockClock, SharedClock, SystemClock};
pub use codec::JobEnvelope;
pub use container::Container;
pub use handler::{JobContext, JobHandler, DEFAULT_TIMEOUT_MINUTES};
pub use job::{Job, JobId, JobPayload, JobRecord, Parameters};
pub use job_state::JobStatus;
pub use registry::{JobFactory, JobRegistry};
