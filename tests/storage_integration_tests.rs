//! Runs the shared backend checks in `common` against every storage backend.
//!
//! Redis and PostgreSQL checks skip themselves when no server is reachable.
//! PostgreSQL is only tried when `PULLQ_TEST_DATABASE_URL` is set.

mod common;

use pullq::storage::{MemoryConfig, StorageConfig, StorageInstance};
use pullq::{MemoryStorage, MockClock, QueueSystem, Storage};
use std::sync::Arc;

async fn memory_system(clock: Arc<MockClock>) -> Option<QueueSystem> {
    let storage = MemoryStorage::new(common::registry()).with_clock(clock);
    Some(QueueSystem::new(Arc::new(storage)))
}

#[cfg(feature = "redis")]
async fn redis_system(clock: Arc<MockClock>) -> Option<QueueSystem> {
    use pullq::{RedisConfig, RedisStorage};

    let config = RedisConfig::new()
        .with_url("redis://127.0.0.1:6379")
        .with_key_prefix(format!("pullq_it_{}", uuid::Uuid::new_v4().simple()))
        .with_database(2)
        .with_poll_interval(std::time::Duration::from_millis(20));

    match RedisStorage::with_config(common::registry(), config).await {
        Ok(storage) => Some(QueueSystem::new(Arc::new(storage.with_clock(clock)))),
        Err(_) => None,
    }
}

#[cfg(feature = "postgres")]
async fn postgres_system(clock: Arc<MockClock>) -> Option<QueueSystem> {
    use pullq::{PostgresConfig, PostgresStorage};

    let url = std::env::var("PULLQ_TEST_DATABASE_URL").ok()?;
    let config = PostgresConfig::new()
        .with_database_url(url)
        .with_table_name(format!("jobs_{}", uuid::Uuid::new_v4().simple()))
        .with_auto_migrate(true)
        .with_max_connections(10)
        .with_poll_interval(std::time::Duration::from_millis(20));

    match PostgresStorage::new(common::registry(), config).await {
        Ok(storage) => Some(QueueSystem::new(Arc::new(storage.with_clock(clock)))),
        Err(e) => {
            println!("PostgreSQL not available: {}", e);
            None
        }
    }
}

macro_rules! backend_checks {
    ($backend:ident, $setup:ident, [$($check:ident),* $(,)?]) => {
        mod $backend {
            $(
                #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
                async fn $check() {
                    let clock = super::common::mock_clock();
                    let Some(system) = super::$setup(clock.clone()).await else {
                        println!("Skipping {} test - backend not available", stringify!($backend));
                        return;
                    };
                    super::common::$check(&system, &clock).await;
                }
            )*
        }
    };
}

backend_checks!(
    memory,
    memory_system,
    [
        count_excludes_future_jobs,
        scheduled_jobs_wait_for_their_time,
        enqueue_assigns_identity,
        doubling_job_finishes_with_result,
        reservation_hides_job_until_timeout,
        stale_commit_is_rejected,
        untracked_jobs_are_rejected,
        copies_of_reserved_jobs_are_not_run,
        concurrent_reservations_are_exclusive,
        retries_are_counted_and_delayed,
        deferral_keeps_retry_count,
        failures_are_committed,
        progress_is_clamped,
        unknown_job_types_fail_hydration,
        blocking_reserve_times_out,
        worker_loop_drains_queue,
    ]
);

#[cfg(feature = "redis")]
backend_checks!(
    redis,
    redis_system,
    [
        count_excludes_future_jobs,
        scheduled_jobs_wait_for_their_time,
        enqueue_assigns_identity,
        doubling_job_finishes_with_result,
        reservation_hides_job_until_timeout,
        stale_commit_is_rejected,
        untracked_jobs_are_rejected,
        copies_of_reserved_jobs_are_not_run,
        concurrent_reservations_are_exclusive,
        retries_are_counted_and_delayed,
        deferral_keeps_retry_count,
        failures_are_committed,
        progress_is_clamped,
        unknown_job_types_fail_hydration,
        blocking_reserve_times_out,
        worker_loop_drains_queue,
    ]
);

#[cfg(feature = "postgres")]
backend_checks!(
    postgres,
    postgres_system,
    [
        count_excludes_future_jobs,
        scheduled_jobs_wait_for_their_time,
        enqueue_assigns_identity,
        doubling_job_finishes_with_result,
        reservation_hides_job_until_timeout,
        stale_commit_is_rejected,
        untracked_jobs_are_rejected,
        copies_of_reserved_jobs_are_not_run,
        concurrent_reservations_are_exclusive,
        retries_are_counted_and_delayed,
        deferral_keeps_retry_count,
        failures_are_committed,
        progress_is_clamped,
        unknown_job_types_fail_hydration,
        blocking_reserve_times_out,
        worker_loop_drains_queue,
    ]
);

/// Test the storage factory pattern with different configurations
#[tokio::test]
async fn test_storage_factory_memory() {
    let config = StorageConfig::Memory(MemoryConfig::new().with_max_jobs(100));
    let storage = StorageInstance::from_config(config, common::registry())
        .await
        .unwrap();
    assert_eq!(storage.name(), "memory");

    let system = QueueSystem::new(Arc::new(storage));
    let mut job = pullq::Job::new(common::Double).with_parameter("n", 21);
    let id = system.default_queue().enqueue(&mut job).await.unwrap();
    assert_eq!(system.default_queue().name(), pullq::DEFAULT_QUEUE);
    assert_eq!(system.default_queue().count().await.unwrap(), 1);

    let retrieved = system.get_job_by_id(id).await.unwrap().unwrap();
    assert_eq!(retrieved.parameter("n"), Some(&serde_json::json!(21)));
}

#[tokio::test]
async fn test_initial_setup_is_idempotent() {
    let system = memory_system(common::mock_clock()).await.unwrap();
    system.initial_setup().await.unwrap();
    system.initial_setup().await.unwrap();
}
