use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use std::sync::Arc;
use std::time::Duration;

use super::snapshot::{Column, JobSnapshot, JobTracker};
use super::{queue_filter, PostgresConfig, ReserveDeadline, Storage, StorageError};
use crate::core::handler::clamp_progress;
use crate::core::{
    system_clock, Clock, Job, JobId, JobRegistry, Parameters, SharedClock, DEFAULT_TIMEOUT_MINUTES,
};

const COLUMNS: &str = "id, job_type, queue, created, schedule, failed, finished_at, result, \
                       progress, last_attempt, timeout_at, retry_count, version, parameters";

/// SQL form of the eligibility rule: due, not terminal, not under a live reservation.
const ELIGIBLE: &str = "schedule <= $1 AND NOT failed AND finished_at IS NULL \
                        AND (last_attempt IS NULL OR timeout_at IS NULL OR timeout_at <= $1)";

/// PostgreSQL storage implementation for jobs
///
/// All jobs live in one table. Reservation selects the oldest eligible row
/// and claims it with `UPDATE ... WHERE id = $n AND version = $m`; losing
/// that race just means selecting again. Commits use the same version guard
/// and only write the columns that changed.
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    pool: PgPool,
    config: PostgresConfig,
    registry: Arc<JobRegistry>,
    tracker: Arc<JobTracker>,
    clock: SharedClock,
}

impl PostgresStorage {
    /// Create a new PostgreSQL storage with the given configuration
    pub async fn new(
        registry: Arc<JobRegistry>,
        config: PostgresConfig,
    ) -> Result<Self, StorageError> {
        let pool = config
            .pool_options()?
            .connect(&config.database_url)
            .await
            .map_err(|e| {
                StorageError::connection_with_source(
                    format!("Failed to connect to PostgreSQL: {}", e),
                    Box::new(e),
                )
            })?;

        let storage = Self::with_pool(registry, pool, config);

        if storage.config.auto_migrate {
            storage.migrate().await?;
        }

        Ok(storage)
    }

    /// Wrap an existing pool. No connection is made and no schema is created.
    pub fn with_pool(registry: Arc<JobRegistry>, pool: PgPool, config: PostgresConfig) -> Self {
        Self {
            pool,
            config,
            registry,
            tracker: Arc::new(JobTracker::new()),
            clock: system_clock(),
        }
    }

    /// Replace the time source. Every timestamp compared in SQL is bound
    /// from this clock, never taken from the database server.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Helper method to detect if a database error is schema-related
    pub(crate) fn is_schema_error(error: &sqlx::Error) -> bool {
        match error {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().unwrap_or_default();
                let message = db_err.message().to_lowercase();

                code == "42P01" || // undefined_table
                code == "3F000" || // invalid_schema_name
                message.contains("relation") && message.contains("does not exist") ||
                message.contains("schema") && message.contains("does not exist")
            }
            _ => false,
        }
    }

    /// Runs a query, creating the schema and retrying once if the table is
    /// missing and `auto_migrate` is enabled.
    pub(crate) async fn handle_schema_error<T, F, Fut>(
        &self,
        operation: F,
        operation_name: &str,
    ) -> Result<T, StorageError>
    where
        F: Fn() -> Fut + Send,
        Fut: std::future::Future<Output = Result<T, sqlx::Error>> + Send,
    {
        match operation().await {
            Ok(result) => Ok(result),
            Err(e) if Self::is_schema_error(&e) => {
                tracing::warn!("Schema error detected during {}: {}", operation_name, e);

                if self.config.auto_migrate {
                    tracing::info!("Creating job table after schema error...");
                    self.migrate().await?;

                    operation().await.map_err(|retry_err| {
                        StorageError::operation_failed_with_source(
                            operation_name,
                            format!("Operation failed even after migration: {}", retry_err),
                            Box::new(retry_err),
                        )
                    })
                } else {
                    Err(StorageError::operation_failed_with_source(
                        operation_name,
                        format!(
                            "Job table is missing and auto_migrate is disabled; run initial setup first: {}",
                            e
                        ),
                        Box::new(e),
                    ))
                }
            }
            Err(e) => Err(database_error(operation_name, e)),
        }
    }

    /// Create the schema, table and index if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        tracing::info!("Creating job table {} if needed", self.table_name());

        for statement in self.schema_statements() {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::MigrationError {
                    message: format!("Schema setup failed: {}", e),
                })?;
        }

        tracing::info!("Job table {} is ready", self.table_name());
        Ok(())
    }

    fn schema_statements(&self) -> Vec<String> {
        let table = self.table_name();
        vec![
            format!("CREATE SCHEMA IF NOT EXISTS {}", self.config.schema_name),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    id BIGSERIAL PRIMARY KEY,
                    job_type TEXT NOT NULL,
                    queue TEXT NOT NULL,
                    created TIMESTAMPTZ NOT NULL,
                    schedule TIMESTAMPTZ NOT NULL,
                    failed BOOLEAN NOT NULL DEFAULT FALSE,
                    finished_at TIMESTAMPTZ,
                    result JSON,
                    progress DOUBLE PRECISION,
                    last_attempt TIMESTAMPTZ,
                    timeout_at TIMESTAMPTZ,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    version BIGINT NOT NULL DEFAULT 0,
                    parameters JSON NOT NULL
                )
                "#,
                table
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {}_pending_idx ON {} (queue, schedule) \
                 WHERE NOT failed AND finished_at IS NULL",
                self.config.table_name, table
            ),
        ]
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Get the configuration
    pub fn config(&self) -> &PostgresConfig {
        &self.config
    }

    /// Close the connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Build the full table name with schema
    fn table_name(&self) -> String {
        self.config.full_table_name()
    }

    fn select_eligible_sql(&self, filtered: bool) -> String {
        let queue_clause = if filtered { " AND queue = ANY($2)" } else { "" };
        format!(
            "SELECT {} FROM {} WHERE {}{} ORDER BY id LIMIT 1",
            COLUMNS,
            self.table_name(),
            ELIGIBLE,
            queue_clause
        )
    }

    fn row_to_snapshot(row: &PgRow) -> Result<JobSnapshot, StorageError> {
        let retry_count: i32 = column(row, "retry_count")?;
        let parameters: Value = column(row, "parameters")?;

        Ok(JobSnapshot {
            id: JobId(column(row, "id")?),
            job_type: column(row, "job_type")?,
            queue: column(row, "queue")?,
            created: column(row, "created")?,
            schedule: column(row, "schedule")?,
            failed: column(row, "failed")?,
            finished_at: column(row, "finished_at")?,
            result: column(row, "result")?,
            progress: column(row, "progress")?,
            last_attempt: column(row, "last_attempt")?,
            timeout_at: column(row, "timeout_at")?,
            retry_count: u32::try_from(retry_count).map_err(|_| {
                StorageError::invalid_job_data(format!("negative retry count: {}", retry_count))
            })?,
            version: column(row, "version")?,
            parameters: into_parameters(parameters)?,
        })
    }

    /// One non-blocking reservation attempt.
    async fn try_reserve(&self, queues: Option<&[String]>) -> Result<Option<Job>, StorageError> {
        let select = self.select_eligible_sql(queues.is_some());
        let claim = format!(
            "UPDATE {} SET last_attempt = $1, timeout_at = $2, version = version + 1 \
             WHERE id = $3 AND version = $4",
            self.table_name()
        );

        loop {
            let now = self.clock.now();
            let row = self
                .handle_schema_error(
                    || async {
                        let mut query = sqlx::query(&select).bind(now);
                        if let Some(queues) = queues {
                            query = query.bind(queues.to_vec());
                        }
                        query.fetch_optional(&self.pool).await
                    },
                    "reserve",
                )
                .await?;

            let Some(row) = row else {
                return Ok(None);
            };

            let candidate = Self::row_to_snapshot(&row)?;
            let mut job = match candidate.clone().hydrate(&self.registry) {
                Ok(job) => job,
                Err(e) => {
                    let timeout_at = now + ChronoDuration::minutes(DEFAULT_TIMEOUT_MINUTES);
                    let leased = sqlx::query(&claim)
                        .bind(now)
                        .bind(timeout_at)
                        .bind(candidate.id.0)
                        .bind(candidate.version)
                        .execute(&self.pool)
                        .await
                        .map_err(|e| database_error("reserve", e))?;
                    if leased.rows_affected() == 1 {
                        tracing::warn!(
                            "Job {} has unknown type {}, leased aside until {}",
                            candidate.id,
                            candidate.job_type,
                            timeout_at
                        );
                    }
                    return Err(e);
                }
            };
            let timeout_at = now + job.handler().default_timeout_interval();

            let claimed = sqlx::query(&claim)
                .bind(now)
                .bind(timeout_at)
                .bind(candidate.id.0)
                .bind(candidate.version)
                .execute(&self.pool)
                .await
                .map_err(|e| database_error("reserve", e))?;

            if claimed.rows_affected() == 1 {
                job.mark_reserved(now, timeout_at);
                self.tracker.track(&mut job)?;
                tracing::debug!(
                    "Reserved job {} (version {})",
                    candidate.id,
                    job.version()
                );
                return Ok(Some(job));
            }

            tracing::debug!(
                "Job {} changed before it could be claimed, retrying",
                candidate.id
            );
        }
    }

    fn push_column<'a>(
        builder: &mut QueryBuilder<'a, Postgres>,
        column: Column,
        snapshot: &JobSnapshot,
    ) -> Result<(), StorageError> {
        builder.push(column.name()).push(" = ");
        match column {
            Column::Queue => {
                builder.push_bind(snapshot.queue.clone());
            }
            Column::Created => {
                builder.push_bind(snapshot.created);
            }
            Column::Schedule => {
                builder.push_bind(snapshot.schedule);
            }
            Column::Failed => {
                builder.push_bind(snapshot.failed);
            }
            Column::FinishedAt => {
                builder.push_bind(snapshot.finished_at);
            }
            Column::Result => {
                builder.push_bind(snapshot.result.clone()).push("::json");
            }
            Column::Progress => {
                builder.push_bind(snapshot.progress);
            }
            Column::LastAttempt => {
                builder.push_bind(snapshot.last_attempt);
            }
            Column::TimeoutAt => {
                builder.push_bind(snapshot.timeout_at);
            }
            Column::RetryCount => {
                builder.push_bind(retry_count_column(snapshot.retry_count)?);
            }
            Column::Parameters => {
                builder
                    .push_bind(Value::Object(snapshot.parameters.clone()))
                    .push("::json");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn clock(&self) -> &SharedClock {
        &self.clock
    }

    async fn count_pending(&self, queue: &str) -> Result<usize, StorageError> {
        let query = format!(
            "SELECT COUNT(*) FROM {} WHERE {} AND queue = $2",
            self.table_name(),
            ELIGIBLE
        );
        let now = self.clock.now();

        let count: i64 = self
            .handle_schema_error(
                || async {
                    sqlx::query_scalar::<_, i64>(&query)
                        .bind(now)
                        .bind(queue)
                        .fetch_one(&self.pool)
                        .await
                },
                "count_pending",
            )
            .await?;

        pending_count(queue, count)
    }

    async fn enqueue(&self, queue: &str, job: &Job) -> Result<JobId, StorageError> {
        // The id column assigns the identity; the placeholder is never stored.
        let mut snapshot = JobSnapshot::capture(job, JobId(0))?;
        snapshot.queue = queue.to_string();
        let retry_count = retry_count_column(snapshot.retry_count)?;
        let parameters = Value::Object(snapshot.parameters.clone());

        let query = format!(
            r#"
            INSERT INTO {} (
                job_type, queue, created, schedule, failed, finished_at, result,
                progress, last_attempt, timeout_at, retry_count, version, parameters
            ) VALUES ($1, $2, $3, $4, $5, $6, $7::json, $8, $9, $10, $11, $12, $13::json)
            RETURNING id
            "#,
            self.table_name()
        );

        let id: i64 = self
            .handle_schema_error(
                || async {
                    sqlx::query_scalar::<_, i64>(&query)
                        .bind(&snapshot.job_type)
                        .bind(&snapshot.queue)
                        .bind(snapshot.created)
                        .bind(snapshot.schedule)
                        .bind(snapshot.failed)
                        .bind(snapshot.finished_at)
                        .bind(&snapshot.result)
                        .bind(snapshot.progress)
                        .bind(snapshot.last_attempt)
                        .bind(snapshot.timeout_at)
                        .bind(retry_count)
                        .bind(snapshot.version)
                        .bind(&parameters)
                        .fetch_one(&self.pool)
                        .await
                },
                "enqueue",
            )
            .await?;

        Ok(JobId(id))
    }

    async fn reserve(
        &self,
        queues: Option<&[String]>,
        blocking: bool,
        timeout: Duration,
    ) -> Result<Option<Job>, StorageError> {
        let queues = queue_filter(queues);
        if !blocking {
            return self.try_reserve(queues).await;
        }

        let deadline = ReserveDeadline::new(timeout, self.config.poll_interval);
        loop {
            if let Some(job) = self.try_reserve(queues).await? {
                return Ok(Some(job));
            }
            match deadline.next_wait() {
                Some(wait) => tokio::time::sleep(wait).await,
                None => return Ok(None),
            }
        }
    }

    async fn persist_state(&self, job: &mut Job) -> Result<(), StorageError> {
        let before = self.tracker.tracked(job)?;
        let current = JobSnapshot::of(job)?;
        let changed = before.diff(&current);

        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "UPDATE {} SET version = ",
            self.table_name()
        ));
        builder.push_bind(before.version + 1);
        for column in &changed {
            builder.push(", ");
            Self::push_column(&mut builder, *column, &current)?;
        }
        builder
            .push(" WHERE id = ")
            .push_bind(before.id.0)
            .push(" AND version = ")
            .push_bind(before.version);

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| database_error("persist_state", e))?;

        if result.rows_affected() != 1 {
            tracing::warn!(
                "Lock conflict on job {}: version {} is no longer current",
                before.id,
                before.version
            );
            return Err(StorageError::lock_conflict(before.id, before.version));
        }

        job.mark_committed(before.version + 1);
        self.tracker.refresh(job)?;
        Ok(())
    }

    async fn detach(&self, job: &Job) -> Result<(), StorageError> {
        self.tracker.release(job)
    }

    fn is_tracked(&self, job: &Job) -> bool {
        self.tracker.contains(job)
    }

    async fn get_by_id(&self, id: JobId) -> Result<Option<Job>, StorageError> {
        let query = format!("SELECT {} FROM {} WHERE id = $1", COLUMNS, self.table_name());

        let row = self
            .handle_schema_error(
                || async { sqlx::query(&query).bind(id.0).fetch_optional(&self.pool).await },
                "get_by_id",
            )
            .await?;

        match row {
            Some(row) => Ok(Some(Self::row_to_snapshot(&row)?.hydrate(&self.registry)?)),
            None => Ok(None),
        }
    }

    async fn report_progress(&self, job: &Job, progress: f64) -> Result<(), StorageError> {
        let id = job
            .id()
            .ok_or_else(|| StorageError::invalid_job_data("job has no id"))?;
        let query = format!("UPDATE {} SET progress = $1 WHERE id = $2", self.table_name());

        sqlx::query(&query)
            .bind(clamp_progress(progress))
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| database_error("report_progress", e))?;
        Ok(())
    }

    async fn initial_setup(&self) -> Result<(), StorageError> {
        self.migrate().await
    }
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, StorageError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name).map_err(|e| {
        StorageError::serialization_with_source(format!("Failed to read column {}", name), Box::new(e))
    })
}

fn into_parameters(value: Value) -> Result<Parameters, StorageError> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Parameters::new()),
        other => Err(StorageError::invalid_job_data(format!(
            "parameters must be an object, found {}",
            other
        ))),
    }
}

fn pending_count(queue: &str, count: i64) -> Result<usize, StorageError> {
    usize::try_from(count).map_err(|_| {
        StorageError::invalid_job_data(format!("count of queue {} is negative: {}", queue, count))
    })
}

fn retry_count_column(retry_count: u32) -> Result<i32, StorageError> {
    i32::try_from(retry_count)
        .map_err(|_| StorageError::invalid_job_data(format!("retry count too large: {}", retry_count)))
}

fn database_error(operation: &str, e: sqlx::Error) -> StorageError {
    StorageError::operation_failed_with_source(
        operation,
        format!("Database operation failed: {}", e),
        Box::new(e),
    )
}
