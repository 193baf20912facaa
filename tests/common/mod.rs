//! Shared behaviour checks for storage backends.
//!
//! Every backend test file builds a [`QueueSystem`] over its own storage,
//! driven by a [`MockClock`], and calls these functions with it. A backend
//! that passes all of them implements the reservation protocol.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use pullq::{
    Clock, Container, Job, JobContext, JobHandler, JobId, JobRegistry, MockClock, Outcome, PullqError,
    QueueSystem, Result, Storage, StorageError,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Whole seconds, so every backend stores the clock's values exactly.
pub fn start_time() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

pub fn mock_clock() -> Arc<MockClock> {
    Arc::new(MockClock::new(start_time()))
}

pub fn registry() -> Arc<JobRegistry> {
    Arc::new(
        JobRegistry::new()
            .with::<Double>()
            .with::<Flaky>()
            .with::<Snooze>()
            .with::<Silent>()
            .with::<Broken>()
            .with::<LeakyTearDown>()
            .with::<Progress>()
            .with::<Counted>(),
    )
}

fn queues(name: &str) -> Option<Vec<String>> {
    Some(vec![name.to_string()])
}

/// Doubles parameter `n`.
#[derive(Default)]
pub struct Double;

#[async_trait]
impl JobHandler for Double {
    fn job_type(&self) -> &str {
        "math"
    }

    async fn execute(&self, ctx: &mut JobContext<'_>) -> Result<()> {
        let n: i64 = ctx.parameter_as("n")?.unwrap_or_default();
        ctx.finish_with_result(n * 2);
        Ok(())
    }
}

/// Asks for a retry 30 seconds later until it has been retried twice.
#[derive(Default)]
pub struct Flaky;

#[async_trait]
impl JobHandler for Flaky {
    fn job_type(&self) -> &str {
        "flaky"
    }

    async fn execute(&self, ctx: &mut JobContext<'_>) -> Result<()> {
        if ctx.retry_count() < 2 {
            ctx.fail_with_result("upstream unavailable");
            ctx.then_retry();
            ctx.retry_after(ChronoDuration::seconds(30))?;
        } else {
            ctx.finish();
        }
        Ok(())
    }
}

/// Defers itself by an hour once, then finishes.
#[derive(Default)]
pub struct Snooze;

#[async_trait]
impl JobHandler for Snooze {
    fn job_type(&self) -> &str {
        "snooze"
    }

    async fn execute(&self, ctx: &mut JobContext<'_>) -> Result<()> {
        if ctx.parameter("snoozed").is_none() {
            ctx.set_parameter("snoozed", true);
            ctx.defer_for(ChronoDuration::hours(1));
        } else {
            ctx.finish();
        }
        Ok(())
    }
}

/// Records nothing.
#[derive(Default)]
pub struct Silent;

#[async_trait]
impl JobHandler for Silent {
    fn job_type(&self) -> &str {
        "silent"
    }

    async fn execute(&self, _ctx: &mut JobContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Records a result, asks for a retry, then errors anyway.
#[derive(Default)]
pub struct Broken;

#[async_trait]
impl JobHandler for Broken {
    fn job_type(&self) -> &str {
        "broken"
    }

    async fn execute(&self, ctx: &mut JobContext<'_>) -> Result<()> {
        ctx.finish_with_result("half done");
        ctx.then_retry();
        Err(PullqError::job_logic("disk full"))
    }
}

/// Finishes, but its tear-down fails.
#[derive(Default)]
pub struct LeakyTearDown;

#[async_trait]
impl JobHandler for LeakyTearDown {
    fn job_type(&self) -> &str {
        "leaky"
    }

    async fn execute(&self, ctx: &mut JobContext<'_>) -> Result<()> {
        ctx.finish();
        Ok(())
    }

    async fn tear_down(&self, _ctx: &mut JobContext<'_>) -> Result<()> {
        Err(PullqError::job_logic("could not release the lock file"))
    }
}

/// Reports out-of-range progress, then finishes.
#[derive(Default)]
pub struct Progress;

#[async_trait]
impl JobHandler for Progress {
    fn job_type(&self) -> &str {
        "progress"
    }

    async fn execute(&self, ctx: &mut JobContext<'_>) -> Result<()> {
        ctx.report_progress(250.0).await;
        ctx.finish();
        Ok(())
    }
}

/// Number of times [`Counted`] has executed, held in the container.
#[derive(Debug, Default)]
pub struct RunCount(AtomicUsize);

impl RunCount {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bumps the [`RunCount`] in the container, then finishes.
#[derive(Default)]
pub struct Counted;

#[async_trait]
impl JobHandler for Counted {
    fn job_type(&self) -> &str {
        "counted"
    }

    async fn execute(&self, ctx: &mut JobContext<'_>) -> Result<()> {
        if let Some(runs) = ctx.container().get::<RunCount>() {
            runs.0.fetch_add(1, Ordering::SeqCst);
        }
        ctx.finish();
        Ok(())
    }
}

/// Not registered anywhere.
pub struct Orphan;

#[async_trait]
impl JobHandler for Orphan {
    fn job_type(&self) -> &str {
        "orphan"
    }

    async fn execute(&self, ctx: &mut JobContext<'_>) -> Result<()> {
        ctx.finish();
        Ok(())
    }
}

async fn stored(system: &QueueSystem, id: JobId) -> Job {
    system.get_job_by_id(id).await.unwrap().unwrap()
}

pub async fn count_excludes_future_jobs(system: &QueueSystem, clock: &MockClock) {
    let queue = system.queue("count");
    queue.enqueue(&mut Job::new(Double)).await.unwrap();
    queue
        .schedule(&mut Job::new(Double), clock.now() + ChronoDuration::minutes(5))
        .await
        .unwrap();

    assert_eq!(queue.count().await.unwrap(), 1);
    assert_eq!(system.queue("elsewhere").count().await.unwrap(), 0);

    clock.advance(ChronoDuration::minutes(5));
    assert_eq!(queue.count().await.unwrap(), 2);
}

pub async fn scheduled_jobs_wait_for_their_time(system: &QueueSystem, clock: &MockClock) {
    let queue = system.queue("later");
    let at = clock.now() + ChronoDuration::hours(1);
    let id = queue
        .schedule(&mut Job::new(Double).with_parameter("n", 3), at)
        .await
        .unwrap();
    let worker = system.worker(queues("later"));

    assert!(worker.reserve(false, Duration::ZERO).await.unwrap().is_none());

    clock.advance(ChronoDuration::minutes(59));
    assert!(worker.reserve(false, Duration::ZERO).await.unwrap().is_none());

    clock.advance(ChronoDuration::minutes(1));
    let mut job = worker.reserve(false, Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(job.id(), Some(id));
    assert_eq!(job.schedule(), Some(at));
    assert_eq!(worker.run(&mut job).await.unwrap(), Outcome::FinishedWithResult);
    assert_eq!(stored(system, id).await.result(), Some(&json!(6)));
}

pub async fn enqueue_assigns_identity(system: &QueueSystem, clock: &MockClock) {
    let queue = system.queue("identity");
    let mut job = Job::new(Double).with_parameter("n", 1).with_parameter("label", "first");

    let id = queue.enqueue(&mut job).await.unwrap();
    assert_eq!(job.id(), Some(id));
    assert_eq!(job.version(), 0);

    let again = queue.enqueue(&mut job).await;
    assert!(matches!(again, Err(PullqError::InvalidState { .. })));

    let read = stored(system, id).await;
    assert_eq!(read.job_type(), "math");
    assert_eq!(read.queue_name(), Some("identity"));
    assert_eq!(read.created(), Some(clock.now()));
    assert_eq!(read.schedule(), Some(clock.now()));
    assert_eq!(read.parameters(), job.parameters());
    let keys: Vec<&String> = read.parameters().keys().collect();
    assert_eq!(keys, vec!["n", "label"]);

    assert!(system.get_job_by_id(JobId(id.0 + 1000)).await.unwrap().is_none());
}

pub async fn doubling_job_finishes_with_result(system: &QueueSystem, _clock: &MockClock) {
    let id = system
        .queue("math")
        .enqueue(&mut Job::new(Double).with_parameter("n", 5))
        .await
        .unwrap();

    let worker = system.worker(queues("math"));
    let mut job = worker.reserve(false, Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(job.id(), Some(id));

    let outcome = worker.run(&mut job).await.unwrap();
    assert_eq!(outcome, Outcome::FinishedWithResult);

    let read = stored(system, id).await;
    assert!(read.is_finished());
    assert!(!read.is_failed());
    assert_eq!(read.result(), Some(&json!(10)));
    assert_eq!(read.timeout_at(), None);
    assert_eq!(read.version(), 2);
    assert_eq!(system.queue("math").count().await.unwrap(), 0);
}

pub async fn reservation_hides_job_until_timeout(system: &QueueSystem, clock: &MockClock) {
    let queue = system.queue("lease");
    let id = queue.enqueue(&mut Job::new(Double)).await.unwrap();
    let worker = system.worker(queues("lease"));

    let first = worker.reserve(false, Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(first.version(), 1);
    assert_eq!(first.last_attempt(), Some(clock.now()));
    assert_eq!(
        first.timeout_at(),
        Some(clock.now() + ChronoDuration::minutes(15))
    );
    assert_eq!(queue.count().await.unwrap(), 0);
    assert!(worker.reserve(false, Duration::ZERO).await.unwrap().is_none());

    clock.advance(ChronoDuration::minutes(15));
    let second = worker.reserve(false, Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(second.id(), Some(id));
    assert_eq!(second.version(), 2);

    system.storage().detach(&first).await.unwrap();
    system.storage().detach(&second).await.unwrap();
}

pub async fn stale_commit_is_rejected(system: &QueueSystem, clock: &MockClock) {
    let id = system
        .queue("stale")
        .enqueue(&mut Job::new(Double).with_parameter("n", 2))
        .await
        .unwrap();
    let worker = system.worker(queues("stale"));

    let mut stale = worker.reserve(false, Duration::ZERO).await.unwrap().unwrap();
    clock.advance(ChronoDuration::minutes(16));
    let mut fresh = worker.reserve(false, Duration::ZERO).await.unwrap().unwrap();

    let err = worker.run(&mut stale).await.unwrap_err();
    assert!(matches!(err, PullqError::LockConflict { version: 1, .. }));

    let untouched = stored(system, id).await;
    assert!(!untouched.is_finished());
    assert_eq!(untouched.result(), None);
    assert_eq!(untouched.version(), 2);

    assert_eq!(worker.run(&mut fresh).await.unwrap(), Outcome::FinishedWithResult);
    let read = stored(system, id).await;
    assert_eq!(read.version(), 3);
    assert_eq!(read.result(), Some(&json!(4)));
}

pub async fn untracked_jobs_are_rejected(system: &QueueSystem, _clock: &MockClock) {
    let id = system
        .queue("untracked")
        .enqueue(&mut Job::new(Double))
        .await
        .unwrap();

    let mut read = stored(system, id).await;
    let err = system.storage().persist_state(&mut read).await.unwrap_err();
    assert!(matches!(err, StorageError::UntrackedJob { .. }));

    let worker = system.worker(queues("untracked"));
    let job = worker.reserve(false, Duration::ZERO).await.unwrap().unwrap();
    system.storage().detach(&job).await.unwrap();
    assert!(matches!(
        system.storage().detach(&job).await,
        Err(StorageError::UntrackedJob { .. })
    ));
}

pub async fn copies_of_reserved_jobs_are_not_run(system: &QueueSystem, _clock: &MockClock) {
    let counting = QueueSystem::new(system.storage().clone())
        .with_container(Container::new().with(RunCount::default()));
    let runs = counting.container().get::<RunCount>().unwrap();

    let id = counting
        .queue("copies")
        .enqueue(&mut Job::new(Counted))
        .await
        .unwrap();
    let worker = counting.worker(queues("copies"));
    let mut reserved = worker.reserve(false, Duration::ZERO).await.unwrap().unwrap();

    let mut copy = stored(&counting, id).await;
    let err = worker.run(&mut copy).await.unwrap_err();
    assert!(matches!(err, PullqError::UntrackedJob { .. }));
    assert_eq!(runs.get(), 0);
    assert_eq!(stored(&counting, id).await.version(), 1);

    assert_eq!(worker.run(&mut reserved).await.unwrap(), Outcome::Finished);
    assert_eq!(runs.get(), 1);
    assert!(stored(&counting, id).await.is_finished());
}

pub async fn concurrent_reservations_are_exclusive(system: &QueueSystem, _clock: &MockClock) {
    let queue = system.queue("race");
    let mut enqueued = HashSet::new();
    for n in 0..20 {
        let id = queue
            .enqueue(&mut Job::new(Double).with_parameter("n", n))
            .await
            .unwrap();
        enqueued.insert(id);
    }

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let worker = system.worker(queues("race"));
            tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = worker.reserve(false, Duration::ZERO).await.unwrap() {
                    claimed.push(job.id().unwrap());
                }
                claimed
            })
        })
        .collect();

    let mut claimed = Vec::new();
    for result in futures::future::join_all(tasks).await {
        claimed.extend(result.unwrap());
    }

    let unique: HashSet<JobId> = claimed.iter().copied().collect();
    assert_eq!(claimed.len(), 20, "every job claimed exactly once");
    assert_eq!(unique, enqueued);
}

pub async fn retries_are_counted_and_delayed(system: &QueueSystem, clock: &MockClock) {
    let queue = system.queue("retry");
    let id = queue.enqueue(&mut Job::new(Flaky)).await.unwrap();
    let worker = system.worker(queues("retry"));

    for attempt in 0..2u32 {
        let mut job = worker.reserve(false, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(job.retry_count(), attempt);

        let outcome = worker.run(&mut job).await.unwrap();
        let at = clock.now() + ChronoDuration::seconds(30);
        assert_eq!(outcome, Outcome::Retried { at });

        let read = stored(system, id).await;
        assert_eq!(read.retry_count(), attempt + 1);
        assert_eq!(read.schedule(), Some(at));
        assert!(!read.is_failed());
        assert_eq!(read.timeout_at(), None);
        assert_eq!(queue.count().await.unwrap(), 0);

        clock.advance(ChronoDuration::seconds(30));
    }

    let mut job = worker.reserve(false, Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(worker.run(&mut job).await.unwrap(), Outcome::Finished);
    assert_eq!(stored(system, id).await.retry_count(), 2);
}

pub async fn deferral_keeps_retry_count(system: &QueueSystem, clock: &MockClock) {
    let queue = system.queue("defer");
    let id = queue.enqueue(&mut Job::new(Snooze)).await.unwrap();
    let worker = system.worker(queues("defer"));

    let mut job = worker.reserve(false, Duration::ZERO).await.unwrap().unwrap();
    let until = clock.now() + ChronoDuration::hours(1);
    assert_eq!(
        worker.run(&mut job).await.unwrap(),
        Outcome::Deferred { until }
    );

    let read = stored(system, id).await;
    assert_eq!(read.schedule(), Some(until));
    assert_eq!(read.retry_count(), 0);
    assert_eq!(read.parameter("snoozed"), Some(&json!(true)));
    assert!(worker.reserve(false, Duration::ZERO).await.unwrap().is_none());

    clock.advance(ChronoDuration::hours(1));
    let mut job = worker.reserve(false, Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(worker.run(&mut job).await.unwrap(), Outcome::Finished);
}

pub async fn failures_are_committed(system: &QueueSystem, _clock: &MockClock) {
    let queue = system.queue("failures");
    let silent = queue.enqueue(&mut Job::new(Silent)).await.unwrap();
    let broken = queue.enqueue(&mut Job::new(Broken)).await.unwrap();
    let leaky = queue.enqueue(&mut Job::new(LeakyTearDown)).await.unwrap();
    let worker = system.worker(queues("failures"));

    let mut outcomes = Vec::new();
    while let Some(mut job) = worker.reserve(false, Duration::ZERO).await.unwrap() {
        outcomes.push(worker.run(&mut job).await.unwrap());
    }
    assert_eq!(
        outcomes,
        vec![Outcome::Indeterminate, Outcome::Failed, Outcome::Failed]
    );

    for id in [silent, broken, leaky] {
        let read = stored(system, id).await;
        assert!(read.is_failed());
        assert!(!read.is_finished());
        assert_eq!(read.result(), None);
        assert_eq!(read.retry_count(), 0);
    }
    assert_eq!(queue.count().await.unwrap(), 0);
}

pub async fn progress_is_clamped(system: &QueueSystem, _clock: &MockClock) {
    let id = system
        .queue("progress")
        .enqueue(&mut Job::new(Progress))
        .await
        .unwrap();
    let worker = system.worker(queues("progress"));

    let mut job = worker.reserve(false, Duration::ZERO).await.unwrap().unwrap();
    worker.run(&mut job).await.unwrap();

    assert_eq!(stored(system, id).await.progress(), Some(100.0));
}

pub async fn unknown_job_types_fail_hydration(system: &QueueSystem, clock: &MockClock) {
    let queue = system.queue("orphans");
    let orphan = queue.enqueue(&mut Job::new(Orphan)).await.unwrap();
    let valid = queue
        .enqueue(&mut Job::new(Double).with_parameter("n", 1))
        .await
        .unwrap();
    let worker = system.worker(queues("orphans"));

    let err = worker.reserve(false, Duration::ZERO).await.unwrap_err();
    assert!(matches!(err, PullqError::Hydration { .. }));
    assert!(matches!(
        system.get_job_by_id(orphan).await,
        Err(PullqError::Hydration { .. })
    ));

    let mut job = worker.reserve(false, Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(job.id(), Some(valid));
    assert_eq!(worker.run(&mut job).await.unwrap(), Outcome::FinishedWithResult);
    assert!(worker.reserve(false, Duration::ZERO).await.unwrap().is_none());

    clock.advance(ChronoDuration::minutes(15));
    let err = worker.reserve(false, Duration::ZERO).await.unwrap_err();
    assert!(matches!(err, PullqError::Hydration { .. }));
}

pub async fn blocking_reserve_times_out(system: &QueueSystem, _clock: &MockClock) {
    let worker = system.worker(queues("quiet"));
    let started = std::time::Instant::now();

    let job = worker
        .reserve(true, Duration::from_millis(100))
        .await
        .unwrap();
    assert!(job.is_none());
    assert!(started.elapsed() >= Duration::from_millis(100));
}

pub async fn worker_loop_drains_queue(system: &QueueSystem, _clock: &MockClock) {
    let queue = system.queue("loop");
    for n in 1..=3 {
        queue
            .enqueue(&mut Job::new(Double).with_parameter("n", n))
            .await
            .unwrap();
    }

    let worker = system.worker_with_config(
        pullq::WorkerConfig::new("loop-worker")
            .queues(queues("loop"))
            .reserve_timeout(Duration::from_millis(50)),
    );
    let handle = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.work().await })
    };

    for _ in 0..100 {
        if queue.count().await.unwrap() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    worker.shutdown();

    let processed = handle.await.unwrap().unwrap();
    assert_eq!(processed, 3);
}
