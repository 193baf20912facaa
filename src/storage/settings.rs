//! Configuration settings loaded from environment variables
//!
//! Every variable is optional. Missing values fall back to defaults and a
//! malformed value is reported as an error, never as a panic.

use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::storage::{MemoryConfig, StorageConfig, StorageError};

/// Which backend [`Settings::storage_config`] builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Memory,
    Redis,
    Postgres,
}

impl std::str::FromStr for Backend {
    type Err = StorageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "memory" => Ok(Backend::Memory),
            "redis" => Ok(Backend::Redis),
            "postgres" | "postgresql" => Ok(Backend::Postgres),
            other => Err(StorageError::configuration(format!(
                "Unknown backend: {}",
                other
            ))),
        }
    }
}

/// Application settings loaded from environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// `PULLQ_BACKEND`
    pub backend: Backend,
    /// `DATABASE_URL`
    pub database_url: Option<String>,
    /// `REDIS_URL`
    pub redis_url: Option<String>,
    /// `PULLQ_REDIS_DB`, overriding the database in `REDIS_URL`
    pub redis_database: Option<u8>,
    /// `PULLQ_KEY_PREFIX`
    pub key_prefix: Option<String>,
    /// `PULLQ_POLL_INTERVAL_MS`
    pub poll_interval: Option<Duration>,
    /// `PULLQ_RESERVE_TIMEOUT_SECS`
    pub reserve_timeout: Duration,
    /// `PULLQ_LOG_LEVEL`
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            database_url: None,
            redis_url: None,
            redis_database: None,
            key_prefix: None,
            poll_interval: None,
            reserve_timeout: Duration::from_secs(5),
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from the process environment
    pub fn from_env() -> Result<Self, StorageError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load settings through an arbitrary lookup, e.g. a map in tests.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, StorageError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        fn parse<T>(key: &str, value: Option<String>) -> Result<Option<T>, StorageError>
        where
            T: std::str::FromStr,
            T::Err: std::fmt::Display,
        {
            value
                .map(|value| {
                    value.trim().parse::<T>().map_err(|e| {
                        StorageError::configuration(format!(
                            "Invalid value for {}: {} ({})",
                            key, value, e
                        ))
                    })
                })
                .transpose()
        }
        let parse_u64 = |key: &str| parse::<u64>(key, get(key));

        let defaults = Settings::default();

        Ok(Settings {
            backend: get("PULLQ_BACKEND")
                .map(|v| v.parse())
                .transpose()?
                .unwrap_or(defaults.backend),
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL"),
            redis_database: parse::<u8>("PULLQ_REDIS_DB", get("PULLQ_REDIS_DB"))?,
            key_prefix: get("PULLQ_KEY_PREFIX"),
            poll_interval: parse_u64("PULLQ_POLL_INTERVAL_MS")?.map(Duration::from_millis),
            reserve_timeout: parse_u64("PULLQ_RESERVE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.reserve_timeout),
            log_level: get("PULLQ_LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }

    /// Build the storage configuration for the selected backend.
    pub fn storage_config(&self) -> Result<StorageConfig, StorageError> {
        match self.backend {
            Backend::Memory => {
                let mut config = MemoryConfig::default();
                if let Some(interval) = self.poll_interval {
                    config = config.with_poll_interval(interval);
                }
                Ok(StorageConfig::Memory(config))
            }
            #[cfg(feature = "redis")]
            Backend::Redis => {
                let mut config = crate::storage::RedisConfig::default();
                if let Some(url) = &self.redis_url {
                    config = config.with_url(url.clone());
                }
                if let Some(database) = self.redis_database {
                    config = config.with_database(database);
                }
                if let Some(prefix) = &self.key_prefix {
                    config = config.with_key_prefix(prefix.clone());
                }
                if let Some(interval) = self.poll_interval {
                    config = config.with_poll_interval(interval);
                }
                Ok(StorageConfig::Redis(config))
            }
            #[cfg(feature = "postgres")]
            Backend::Postgres => {
                let url = self.database_url.clone().ok_or_else(|| {
                    StorageError::configuration("DATABASE_URL must be set for the postgres backend")
                })?;
                let mut config = crate::storage::PostgresConfig::default().with_database_url(url);
                if let Some(interval) = self.poll_interval {
                    config = config.with_poll_interval(interval);
                }
                Ok(StorageConfig::Postgres(config))
            }
            #[allow(unreachable_patterns)]
            other => Err(StorageError::configuration(format!(
                "Backend {:?} is not compiled in; enable the matching cargo feature",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_empty_environment_uses_defaults() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings.backend, Backend::Memory);
        assert_eq!(settings.reserve_timeout, Duration::from_secs(5));
        assert_eq!(settings.log_level, "info");
        assert!(settings.database_url.is_none());

        let config = settings.storage_config().unwrap();
        assert!(matches!(config, StorageConfig::Memory(_)));
    }

    #[test]
    fn test_values_are_parsed() {
        let settings = Settings::from_lookup(lookup(&[
            ("PULLQ_BACKEND", "Memory"),
            ("PULLQ_POLL_INTERVAL_MS", "50"),
            ("PULLQ_RESERVE_TIMEOUT_SECS", "2"),
            ("PULLQ_LOG_LEVEL", "debug"),
        ]))
        .unwrap();

        assert_eq!(settings.poll_interval, Some(Duration::from_millis(50)));
        assert_eq!(settings.reserve_timeout, Duration::from_secs(2));
        assert_eq!(settings.log_level, "debug");
        assert_eq!(
            settings.storage_config().unwrap().poll_interval(),
            Duration::from_millis(50)
        );
    }

    #[test]
    fn test_malformed_values_are_errors() {
        let err = Settings::from_lookup(lookup(&[("PULLQ_POLL_INTERVAL_MS", "soon")])).unwrap_err();
        assert!(matches!(err, StorageError::Configuration { .. }));

        let err = Settings::from_lookup(lookup(&[("PULLQ_BACKEND", "mongo")])).unwrap_err();
        assert!(matches!(err, StorageError::Configuration { .. }));
    }

    #[test]
    #[cfg(feature = "redis")]
    fn test_redis_settings_reach_the_connection() {
        let settings = Settings::from_lookup(lookup(&[
            ("PULLQ_BACKEND", "redis"),
            ("REDIS_URL", "redis://:secret@cache:6379/1"),
            ("PULLQ_REDIS_DB", "4"),
            ("PULLQ_KEY_PREFIX", "mail"),
        ]))
        .unwrap();

        let StorageConfig::Redis(config) = settings.storage_config().unwrap() else {
            panic!("expected a redis config");
        };
        assert_eq!(config.key_prefix, "mail");
        let info = config.connection_info().unwrap();
        assert_eq!(info.redis.db, 4);
        assert_eq!(info.redis.password.as_deref(), Some("secret"));

        let err = Settings::from_lookup(lookup(&[("PULLQ_REDIS_DB", "300")])).unwrap_err();
        assert!(matches!(err, StorageError::Configuration { .. }));
    }

    #[test]
    #[cfg(feature = "postgres")]
    fn test_postgres_requires_database_url() {
        let settings = Settings::from_lookup(lookup(&[("PULLQ_BACKEND", "postgres")])).unwrap();
        assert!(settings.storage_config().is_err());
    }
}
