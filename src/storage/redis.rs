use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Client, RedisResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use super::snapshot::{Column, JobSnapshot, JobTracker};
use super::{queue_filter, RedisConfig, ReserveDeadline, Storage, StorageError};
use crate::core::handler::clamp_progress;
use crate::core::{system_clock, Clock, Job, JobEnvelope, JobId, JobRegistry, SharedClock};

/// Moves due entries of the delayed set onto the ready list, then claims the
/// head of the list. The pop is the claim: a popped id is handed to exactly
/// one caller, which gets the job hash with its reservation already applied.
const RESERVE_SCRIPT: &str = r#"
    local now = tonumber(ARGV[1])
    local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
    for _, id in ipairs(due) do
        redis.call('ZREM', KEYS[2], id)
        redis.call('RPUSH', KEYS[1], id)
    end

    while true do
        local id = redis.call('LPOP', KEYS[1])
        if not id then
            return false
        end
        local key = ARGV[2] .. id
        local lease = redis.call('HGET', key, 'lease_ms')
        if lease then
            local timeout_at = now + tonumber(lease)
            redis.call('HSET', key, 'last_attempt', ARGV[1], 'timeout_at', timeout_at)
            redis.call('HINCRBY', key, 'version', 1)
            redis.call('ZADD', KEYS[2], timeout_at, id)
            return redis.call('HGETALL', key)
        end
    end
"#;

/// Claims an id a BLPOP already took off `KEYS[1]`. Between the pop and
/// this script the holder of an expired reservation may have committed, so
/// the job is claimed only if it is still due and not final; otherwise it
/// is left wherever that commit placed it.
const CLAIM_SCRIPT: &str = r#"
    local now = tonumber(ARGV[1])
    local id = ARGV[3]
    local key = ARGV[2] .. id
    local state = redis.call('HMGET', key, 'lease_ms', 'failed', 'finished_at', 'schedule')
    local lease, failed, finished_at, schedule = state[1], state[2], state[3], state[4]
    if not lease or failed == '1' or (finished_at and finished_at ~= '') then
        return false
    end
    if tonumber(schedule) > now then
        return false
    end

    local timeout_at = now + tonumber(lease)
    redis.call('LREM', KEYS[1], 0, id)
    redis.call('HSET', key, 'last_attempt', ARGV[1], 'timeout_at', timeout_at)
    redis.call('HINCRBY', key, 'version', 1)
    redis.call('ZADD', KEYS[2], timeout_at, id)
    return redis.call('HGETALL', key)
"#;

/// Version-guarded commit. Writes the changed fields and moves the id to
/// wherever its new state belongs: the ready list, the delayed set, or
/// nowhere once the job is final.
const PERSIST_SCRIPT: &str = r#"
    if redis.call('HGET', KEYS[1], 'version') ~= ARGV[1] then
        return 0
    end
    redis.call('HINCRBY', KEYS[1], 'version', 1)
    if #ARGV > 4 then
        redis.call('HSET', KEYS[1], unpack(ARGV, 5))
    end

    redis.call('LREM', KEYS[2], 0, ARGV[2])
    redis.call('ZREM', KEYS[3], ARGV[2])
    if ARGV[3] == 'ready' then
        redis.call('RPUSH', KEYS[4], ARGV[2])
    elseif ARGV[3] == 'delayed' then
        redis.call('ZADD', KEYS[5], ARGV[4], ARGV[2])
    end
    return 1
"#;

const PROGRESS_SCRIPT: &str = r#"
    if redis.call('EXISTS', KEYS[1]) == 0 then
        return 0
    end
    redis.call('HSET', KEYS[1], 'progress', ARGV[1])
    return 1
"#;

/// Where a job id lives in the queue index.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Placement {
    /// Eligible now; on the queue's list.
    Ready,
    /// Eligible at the given epoch millis; in the queue's delayed set.
    Delayed(i64),
    /// Failed or finished; indexed nowhere.
    Done,
}

impl Placement {
    fn of(snapshot: &JobSnapshot, now: DateTime<Utc>) -> Self {
        if snapshot.failed || snapshot.finished_at.is_some() {
            return Placement::Done;
        }
        let mut available = snapshot.schedule;
        if let (Some(_), Some(timeout_at)) = (snapshot.last_attempt, snapshot.timeout_at) {
            available = available.max(timeout_at);
        }
        if available <= now {
            Placement::Ready
        } else {
            Placement::Delayed(available.timestamp_millis())
        }
    }

    fn as_arg(&self) -> &'static str {
        match self {
            Placement::Ready => "ready",
            Placement::Delayed(_) => "delayed",
            Placement::Done => "done",
        }
    }

    fn score(&self) -> i64 {
        match self {
            Placement::Delayed(at) => *at,
            _ => 0,
        }
    }
}

/// Redis storage implementation for jobs
///
/// Each job is a hash under `{prefix}:job:{id}`. Its `envelope` field holds
/// the [`JobEnvelope`] (type, creation time, parameters); the remaining
/// fields are the reservation and outcome state. A queue is a list of ids
/// that are eligible now plus a sorted set of ids that become eligible later,
/// scored by epoch millis. Live reservations sit in that sorted set under
/// their timeout, so an abandoned job drifts back onto the list on its own.
///
/// The creation time round-trips through the envelope and keeps whole
/// seconds; every other timestamp is stored with millisecond precision.
///
/// Blocking reservations BLPOP the ready lists on a connection of their own,
/// since a blocked command would stall every other caller sharing the
/// multiplexed [`ConnectionManager`].
pub struct RedisStorage {
    client: Client,
    connection_manager: ConnectionManager,
    config: RedisConfig,
    registry: Arc<JobRegistry>,
    tracker: Arc<JobTracker>,
    clock: SharedClock,
}

impl std::fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStorage")
            .field("config", &self.config)
            .field("tracked", &self.tracker.len())
            .finish()
    }
}

impl RedisStorage {
    /// Create a new Redis storage with the specified configuration
    pub async fn with_config(
        registry: Arc<JobRegistry>,
        config: RedisConfig,
    ) -> Result<Self, StorageError> {
        let client = Client::open(config.connection_info()?).map_err(|e| {
            StorageError::connection_with_source("Failed to create Redis client", Box::new(e))
        })?;

        let connection_manager = timeout(
            config.connection_timeout,
            ConnectionManager::new(client.clone()),
        )
            .await
            .map_err(|_| StorageError::timeout(config.connection_timeout.as_millis() as u64))?
            .map_err(|e| {
                StorageError::connection_with_source(
                    "Failed to create connection manager",
                    Box::new(e),
                )
            })?;

        Ok(Self {
            client,
            connection_manager,
            config,
            registry,
            tracker: Arc::new(JobTracker::new()),
            clock: system_clock(),
        })
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    fn get_connection(&self) -> ConnectionManager {
        self.connection_manager.clone()
    }

    /// A fresh connection nobody else sends commands on.
    async fn blocking_connection(&self) -> Result<MultiplexedConnection, StorageError> {
        timeout(
            self.config.connection_timeout,
            self.client.get_multiplexed_tokio_connection(),
        )
        .await
        .map_err(|_| StorageError::timeout(self.config.connection_timeout.as_millis() as u64))?
        .map_err(|e| {
            StorageError::connection_with_source("Failed to open blocking connection", Box::new(e))
        })
    }

    /// Execute a Redis command with timeout
    async fn with_timeout<F, T>(&self, operation: F) -> Result<T, StorageError>
    where
        F: std::future::Future<Output = RedisResult<T>>,
    {
        timeout(self.config.command_timeout, operation)
            .await
            .map_err(|_| StorageError::timeout(self.config.command_timeout.as_millis() as u64))?
            .map_err(|e| {
                StorageError::operation_failed_with_source(
                    "Redis command",
                    e.to_string(),
                    Box::new(e),
                )
            })
    }

    fn job_key_prefix(&self) -> String {
        format!("{}:job:", self.config.key_prefix)
    }

    fn job_key(&self, id: JobId) -> String {
        format!("{}{}", self.job_key_prefix(), id)
    }

    fn queue_key(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.config.key_prefix, queue)
    }

    fn delayed_key(&self, queue: &str) -> String {
        format!("{}:delayed:{}", self.config.key_prefix, queue)
    }

    fn queues_key(&self) -> String {
        format!("{}:queues", self.config.key_prefix)
    }

    fn ids_key(&self) -> String {
        format!("{}:ids", self.config.key_prefix)
    }

    /// Queues to visit for a reservation, in visiting order.
    async fn reserve_order(&self, queues: Option<&[String]>) -> Result<Vec<String>, StorageError> {
        if let Some(queues) = queues {
            return Ok(queues.to_vec());
        }
        let mut conn = self.get_connection();
        let mut known: Vec<String> = self.with_timeout(conn.smembers(self.queues_key())).await?;
        known.sort();
        Ok(known)
    }

    async fn try_reserve(&self, queues: Option<&[String]>) -> Result<Option<Job>, StorageError> {
        let mut conn = self.get_connection();
        let now = self.clock.now().timestamp_millis();

        for queue in self.reserve_order(queues).await? {
            let claimed: Option<HashMap<String, String>> = self
                .with_timeout(
                    redis::Script::new(RESERVE_SCRIPT)
                        .key(self.queue_key(&queue))
                        .key(self.delayed_key(&queue))
                        .arg(now)
                        .arg(self.job_key_prefix())
                        .invoke_async(&mut conn),
                )
                .await?;

            if let Some(fields) = claimed {
                return self.hand_out(&queue, &fields).map(Some);
            }
        }

        Ok(None)
    }

    /// Turns a claimed hash into a tracked job.
    ///
    /// The claim already happened, so a job that fails to hydrate stays
    /// reserved until its lease runs out instead of blocking the queue.
    fn hand_out(&self, queue: &str, fields: &HashMap<String, String>) -> Result<Job, StorageError> {
        let snapshot = decode_fields(fields)?;
        let (id, job_type) = (snapshot.id, snapshot.job_type.clone());
        let mut job = snapshot.hydrate(&self.registry).map_err(|e| {
            tracing::warn!(
                "Job {} has unknown type {}, leased aside until its timeout",
                id,
                job_type
            );
            e
        })?;
        self.tracker.track(&mut job)?;
        tracing::debug!(
            "Reserved job {} from queue {} (version {})",
            id,
            queue,
            job.version()
        );
        Ok(job)
    }

    /// Time until the earliest delayed entry of `queues` becomes due.
    async fn next_due_in(&self, queues: &[String]) -> Result<Option<Duration>, StorageError> {
        let mut conn = self.get_connection();
        let now = self.clock.now().timestamp_millis();
        let mut earliest: Option<i64> = None;

        for queue in queues {
            let head: Vec<(String, f64)> = self
                .with_timeout(conn.zrange_withscores(self.delayed_key(queue), 0, 0))
                .await?;
            if let Some((_, score)) = head.first() {
                let at = *score as i64;
                earliest = Some(earliest.map_or(at, |e| e.min(at)));
            }
        }

        Ok(earliest.map(|at| Duration::from_millis(at.saturating_sub(now).max(0) as u64)))
    }

    /// Waits up to `wait` for an id on any of the ready lists of `queues`,
    /// then claims it.
    async fn wait_for_ready(
        &self,
        conn: &mut MultiplexedConnection,
        queues: &[String],
        wait: Duration,
    ) -> Result<Option<Job>, StorageError> {
        if queues.is_empty() {
            tokio::time::sleep(wait).await;
            return Ok(None);
        }
        // BLPOP treats 0 as "forever"; Redis accepts fractional seconds.
        let seconds = wait.as_secs_f64().max(0.01);
        let keys: Vec<String> = queues.iter().map(|q| self.queue_key(q)).collect();

        let popped: Option<(String, i64)> = timeout(
            wait + self.config.command_timeout,
            conn.blpop(&keys, seconds),
        )
        .await
        .map_err(|_| StorageError::timeout(self.config.command_timeout.as_millis() as u64))?
        .map_err(|e| {
            StorageError::operation_failed_with_source("Redis BLPOP", e.to_string(), Box::new(e))
        })?;

        let Some((list, id)) = popped else {
            return Ok(None);
        };
        let Some(queue) = keys
            .iter()
            .position(|key| *key == list)
            .map(|index| &queues[index])
        else {
            return Err(StorageError::invalid_job_data(format!(
                "BLPOP returned job {} from unexpected list {}",
                id, list
            )));
        };

        let mut shared = self.get_connection();
        let claimed: Option<HashMap<String, String>> = self
            .with_timeout(
                redis::Script::new(CLAIM_SCRIPT)
                    .key(&list)
                    .key(self.delayed_key(queue))
                    .arg(self.clock.now().timestamp_millis())
                    .arg(self.job_key_prefix())
                    .arg(id)
                    .invoke_async(&mut shared),
            )
            .await?;

        match claimed {
            Some(fields) => self.hand_out(queue, &fields).map(Some),
            None => {
                tracing::debug!("Job {} changed between pop and claim, skipping", id);
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl Storage for RedisStorage {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn clock(&self) -> &SharedClock {
        &self.clock
    }

    async fn count_pending(&self, queue: &str) -> Result<usize, StorageError> {
        let mut conn = self.get_connection();
        let now = self.clock.now().timestamp_millis();

        let ready: usize = self.with_timeout(conn.llen(self.queue_key(queue))).await?;
        let due: usize = self
            .with_timeout(conn.zcount(self.delayed_key(queue), "-inf", now))
            .await?;
        Ok(ready + due)
    }

    async fn enqueue(&self, queue: &str, job: &Job) -> Result<JobId, StorageError> {
        let mut conn = self.get_connection();
        let id: i64 = self.with_timeout(conn.incr(self.ids_key(), 1)).await?;
        let id = JobId(id);

        let mut snapshot = JobSnapshot::capture(job, id)?;
        snapshot.queue = queue.to_string();
        let lease_ms = job.handler().default_timeout_interval().num_milliseconds();

        let mut fields = vec![
            ("id", id.to_string()),
            ("version", snapshot.version.to_string()),
            ("lease_ms", lease_ms.to_string()),
        ];
        fields.extend(encode_columns(&snapshot, &Column::ALL)?);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(self.job_key(id), &fields[..])
            .ignore()
            .sadd(self.queues_key(), queue)
            .ignore();
        match Placement::of(&snapshot, self.clock.now()) {
            Placement::Ready => {
                pipe.rpush(self.queue_key(queue), id.0).ignore();
            }
            Placement::Delayed(at) => {
                pipe.zadd(self.delayed_key(queue), id.0, at).ignore();
            }
            Placement::Done => {}
        }

        let _: () = self.with_timeout(pipe.query_async(&mut conn)).await?;
        Ok(id)
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
        let mut conn = self.blocking_connection().await?;
        loop {
            if let Some(job) = self.try_reserve(queues).await? {
                return Ok(Some(job));
            }
            let Some(wait) = deadline.next_wait() else {
                return Ok(None);
            };

            let order = self.reserve_order(queues).await?;
            let wait = match self.next_due_in(&order).await? {
                Some(due) => wait.min(due),
                None => wait,
            };
            if wait.is_zero() {
                continue;
            }
            if let Some(job) = self.wait_for_ready(&mut conn, &order, wait).await? {
                return Ok(Some(job));
            }
        }
    }

    async fn persist_state(&self, job: &mut Job) -> Result<(), StorageError> {
        let before = self.tracker.tracked(job)?;
        let current = JobSnapshot::of(job)?;
        let changed = before.diff(&current);
        let placement = Placement::of(&current, self.clock.now());

        let persist = redis::Script::new(PERSIST_SCRIPT);
        let mut script = persist.prepare_invoke();
        script
            .key(self.job_key(before.id))
            .key(self.queue_key(&before.queue))
            .key(self.delayed_key(&before.queue))
            .key(self.queue_key(&current.queue))
            .key(self.delayed_key(&current.queue))
            .arg(before.version)
            .arg(before.id.0)
            .arg(placement.as_arg())
            .arg(placement.score());
        for (field, value) in encode_columns(&current, &changed)? {
            script.arg(field).arg(value);
        }

        let mut conn = self.get_connection();
        let applied: i32 = self.with_timeout(script.invoke_async(&mut conn)).await?;

        if applied != 1 {
            tracing::warn!(
                "Lock conflict on job {}: version {} is no longer current",
                before.id,
                before.version
            );
            return Err(StorageError::lock_conflict(before.id, before.version));
        }

        if changed.contains(&Column::Queue) {
            let _: () = self
                .with_timeout(conn.sadd(self.queues_key(), &current.queue))
                .await?;
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
        let mut conn = self.get_connection();
        let fields: HashMap<String, String> =
            self.with_timeout(conn.hgetall(self.job_key(id))).await?;

        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(decode_fields(&fields)?.hydrate(&self.registry)?))
    }

    async fn report_progress(&self, job: &Job, progress: f64) -> Result<(), StorageError> {
        let id = job
            .id()
            .ok_or_else(|| StorageError::invalid_job_data("job has no id"))?;

        let mut conn = self.get_connection();
        let updated: i32 = self
            .with_timeout(
                redis::Script::new(PROGRESS_SCRIPT)
                    .key(self.job_key(id))
                    .arg(clamp_progress(progress).to_string())
                    .invoke_async(&mut conn),
            )
            .await?;

        if updated == 0 {
            return Err(StorageError::job_not_found(id));
        }
        Ok(())
    }
}

fn millis(at: DateTime<Utc>) -> String {
    at.timestamp_millis().to_string()
}

fn optional_millis(at: Option<DateTime<Utc>>) -> String {
    at.map(millis).unwrap_or_default()
}

fn envelope_of(snapshot: &JobSnapshot) -> JobEnvelope {
    JobEnvelope {
        job_type: snapshot.job_type.clone(),
        created: snapshot.created.timestamp(),
        schedule: snapshot.schedule.timestamp(),
        parameters: snapshot.parameters.clone(),
    }
}

/// Hash fields for `columns`, in the order given. Creation time and
/// parameters live in the envelope, which is rewritten whenever they or
/// the schedule change.
fn encode_columns(
    snapshot: &JobSnapshot,
    columns: &[Column],
) -> Result<Vec<(&'static str, String)>, StorageError> {
    let mut fields = Vec::with_capacity(columns.len() + 1);
    let mut envelope = false;

    for column in columns {
        let value = match column {
            Column::Created | Column::Parameters => {
                envelope = true;
                continue;
            }
            Column::Schedule => {
                envelope = true;
                millis(snapshot.schedule)
            }
            Column::Queue => snapshot.queue.clone(),
            Column::Failed => if snapshot.failed { "1" } else { "0" }.to_string(),
            Column::FinishedAt => optional_millis(snapshot.finished_at),
            Column::Result => match &snapshot.result {
                Some(result) => serde_json::to_string(result)?,
                None => String::new(),
            },
            Column::Progress => snapshot.progress.map(|p| p.to_string()).unwrap_or_default(),
            Column::LastAttempt => optional_millis(snapshot.last_attempt),
            Column::TimeoutAt => optional_millis(snapshot.timeout_at),
            Column::RetryCount => snapshot.retry_count.to_string(),
        };
        fields.push((column.name(), value));
    }

    if envelope {
        fields.push(("envelope", envelope_of(snapshot).encode()?));
    }
    Ok(fields)
}

fn decode_fields(fields: &HashMap<String, String>) -> Result<JobSnapshot, StorageError> {
    let field = |name: &str| -> Result<&str, StorageError> {
        fields
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| StorageError::invalid_job_data(format!("missing field {}", name)))
    };
    let number = |name: &str| -> Result<i64, StorageError> {
        let raw = field(name)?;
        raw.parse::<i64>().map_err(|_| {
            StorageError::invalid_job_data(format!("field {} is not a number: {}", name, raw))
        })
    };
    let timestamp = |name: &str| -> Result<Option<DateTime<Utc>>, StorageError> {
        match fields.get(name).map(String::as_str) {
            None | Some("") => Ok(None),
            Some(_) => {
                let ms = number(name)?;
                Utc.timestamp_millis_opt(ms).single().map(Some).ok_or_else(|| {
                    StorageError::invalid_job_data(format!("field {} is out of range: {}", name, ms))
                })
            }
        }
    };
    let required = |name: &str| -> Result<DateTime<Utc>, StorageError> {
        timestamp(name)?
            .ok_or_else(|| StorageError::invalid_job_data(format!("field {} is empty", name)))
    };

    let result = match field("result").unwrap_or("") {
        "" => None,
        raw => Some(serde_json::from_str(raw)?),
    };
    let progress = match field("progress").unwrap_or("") {
        "" => None,
        raw => Some(raw.parse::<f64>().map_err(|_| {
            StorageError::invalid_job_data(format!("field progress is not a number: {}", raw))
        })?),
    };
    let retry_count = u32::try_from(number("retry_count")?)
        .map_err(|_| StorageError::invalid_job_data("retry count out of range"))?;
    let envelope = JobEnvelope::decode(field("envelope")?)?;

    Ok(JobSnapshot {
        id: JobId(number("id")?),
        created: envelope.created_at()?,
        job_type: envelope.job_type,
        queue: field("queue")?.to_string(),
        schedule: required("schedule")?,
        failed: field("failed")? == "1",
        finished_at: timestamp("finished_at")?,
        result,
        progress,
        last_attempt: timestamp("last_attempt")?,
        timeout_at: timestamp("timeout_at")?,
        retry_count,
        version: number("version")?,
        parameters: envelope.parameters,
    })
}
