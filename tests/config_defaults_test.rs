//! Config structs and settings must build without any environment variables
//! and report bad values as errors instead of panicking.

use pullq::storage::{Backend, MemoryConfig, StorageConfig};
use pullq::Settings;
use std::collections::HashMap;
use std::time::Duration;

#[test]
fn test_memory_config_defaults() {
    let memory_config = MemoryConfig::default();
    assert_eq!(memory_config.max_jobs, Some(10_000));
    assert_eq!(memory_config.poll_interval, Duration::from_millis(250));
    assert_eq!(
        StorageConfig::Memory(memory_config).poll_interval(),
        Duration::from_millis(250)
    );
}

#[test]
#[cfg(feature = "redis")]
fn test_redis_config_defaults() {
    use pullq::storage::RedisConfig;

    let redis_config = RedisConfig::default();
    assert!(redis_config.url.starts_with("redis://"));
    assert_eq!(redis_config.key_prefix, "pullq");
    assert_eq!(redis_config.poll_interval, Duration::from_secs(1));
}

#[test]
#[cfg(feature = "postgres")]
fn test_postgres_config_defaults() {
    use pullq::storage::PostgresConfig;

    let postgres_config = PostgresConfig::default();
    assert!(postgres_config.database_url.starts_with("postgres"));
    assert_eq!(postgres_config.max_connections, 20);
    assert_eq!(postgres_config.full_table_name(), "public.job_queue");
    assert!(!postgres_config.auto_migrate);
}

#[test]
fn test_settings_from_lookup() {
    let env: HashMap<&str, &str> = [
        ("PULLQ_BACKEND", "memory"),
        ("PULLQ_POLL_INTERVAL_MS", "40"),
        ("PULLQ_LOG_LEVEL", "pullq=debug"),
    ]
    .into_iter()
    .collect();

    let settings = Settings::from_lookup(|key| env.get(key).map(|v| v.to_string())).unwrap();
    assert_eq!(settings.backend, Backend::Memory);
    assert_eq!(settings.log_level, "pullq=debug");

    match settings.storage_config().unwrap() {
        StorageConfig::Memory(config) => {
            assert_eq!(config.poll_interval, Duration::from_millis(40))
        }
        #[allow(unreachable_patterns)]
        other => panic!("expected memory config, got {:?}", other),
    }
}

#[test]
fn test_settings_reject_bad_values() {
    let bad_backend = Settings::from_lookup(|key| {
        (key == "PULLQ_BACKEND").then(|| "cassandra".to_string())
    });
    assert!(bad_backend.is_err());

    let bad_interval = Settings::from_lookup(|key| {
        (key == "PULLQ_POLL_INTERVAL_MS").then(|| "soon".to_string())
    });
    assert!(bad_interval.is_err());
}
