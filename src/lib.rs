//! # pullq
//!
//! A pull-based background job queue with optimistic-concurrency
//! reservations.
//!
//! Producers put jobs on named queues. Workers pull them, run them and commit
//! the outcome. There is no central dispatcher and no lock table: every
//! reservation and every commit is a compare-and-swap on a per-job version
//! number, and a reservation that is never committed simply times out and
//! makes the job eligible again.
//!
//! ## 🎯 **Storage Backends**
//!
//! - **[`MemoryStorage`]**: in-process reference backend for development and tests
//! - **`RedisStorage`** (feature `redis`): lists per queue, `LPOP` as the claim, Lua for commits
//! - **`PostgresStorage`** (feature `postgres`): one table, `UPDATE ... WHERE version = $n` as the claim
//!
//! ## ⚡ **Quick Start**
//!
//! ```rust
//! use pullq::{Job, JobContext, JobHandler, JobRegistry, MemoryStorage, Outcome, QueueSystem, Result};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[derive(Default)]
//! struct Double;
//!
//! #[async_trait]
//! impl JobHandler for Double {
//!     fn job_type(&self) -> &str {
//!         "math"
//!     }
//!
//!     async fn execute(&self, ctx: &mut JobContext<'_>) -> Result<()> {
//!         let n: i64 = ctx.parameter_as("n")?.unwrap_or_default();
//!         ctx.finish_with_result(n * 2);
//!         Ok(())
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let registry = Arc::new(JobRegistry::new().with::<Double>());
//! let system = QueueSystem::new(Arc::new(MemoryStorage::new(registry)));
//!
//! let mut job = Job::new(Double).with_parameter("n", 5);
//! let id = system.default_queue().enqueue(&mut job).await.unwrap();
//!
//! let worker = system.worker(None);
//! let mut reserved = worker.reserve(false, Duration::ZERO).await.unwrap().unwrap();
//! let outcome = worker.run(&mut reserved).await.unwrap();
//! assert_eq!(outcome, Outcome::FinishedWithResult);
//!
//! let stored = system.get_job_by_id(id).await.unwrap().unwrap();
//! assert_eq!(stored.result(), Some(&serde_json::json!(10)));
//! # });
//! ```
//!
//! ## 🔒 **Reservation Protocol**
//!
//! ```text
//! enqueue ──→ Pending ──reserve (CAS v→v+1)──→ Reserved ──run──→ persist (CAS v+1→v+2) ──→ detach
//!                ↑                                 │
//!                └──────── timeout_at passes ──────┘
//! ```
//!
//! A commit from a worker whose reservation already expired and was taken
//! over fails with [`PullqError::LockConflict`]; it is never applied.
//!
//! ## 🔧 **Error Handling**
//!
//! ```rust
//! use pullq::{PullqError, Result};
//!
//! fn describe(result: Result<()>) -> &'static str {
//!     match result {
//!         Ok(()) => "ok",
//!         Err(PullqError::LockConflict { .. }) => "another worker owns the job",
//!         Err(PullqError::Hydration { .. }) => "stored job type is not registered",
//!         Err(_) => "other",
//!     }
//! }
//!
//! assert_eq!(describe(Ok(())), "ok");
//! ```
//!
//! Errors returned by job code never reach the worker's caller: they are
//! logged and committed as a failed outcome.

pub mod core;
pub mod error;
pub mod processing;
pub mod storage;

// Re-export main types for convenience
pub use core::{
    Clock, Container, Job, JobContext, JobEnvelope, JobHandler, JobId, JobRegistry, JobStatus,
    MockClock, Parameters, SharedClock, SystemClock,
};
pub use error::{PullqError, Result};
pub use processing::{Outcome, Queue, QueueSystem, Worker, WorkerConfig, DEFAULT_QUEUE};
pub use storage::{
    MemoryConfig, MemoryStorage, Settings, Storage, StorageConfig, StorageError, StorageInstance,
};

#[cfg(feature = "redis")]
pub use storage::{RedisConfig, RedisStorage};

#[cfg(feature = "postgres")]
pub use storage::{PostgresConfig, PostgresStorage};
