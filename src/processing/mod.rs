//! Job processing
//!
//! This module contains the producer and consumer sides of the queue: the
//! [`QueueSystem`] context, named [`Queue`] handles, and the [`Worker`] that
//! reserves, runs and commits jobs.

pub mod queue;
pub mod system;
pub mod worker;

pub use queue::Queue;
pub use system::{QueueSystem, DEFAULT_QUEUE};
pub use worker::{Outcome, Worker, WorkerConfig};
