//! Redis-backed shared job store.
//!
//! Several processes can point at the same namespace and behave as one
//! logical queue. Every state change runs as a Lua script, so each one is
//! atomic on the server.
//!
//! # Key layout
//!
//! | Key                    | Type   | Content                                       |
//! |------------------------|--------|-----------------------------------------------|
//! | `{ns}:job:{id}`        | string | full JSON record, rewritten on every change   |
//! | `{ns}:ready`           | zset   | one member per `Pending` job, see below       |
//! | `{ns}:members`         | hash   | job id → its current ready-set member         |
//! | `{ns}:processing`      | zset   | job id, scored by claim time (ms)             |
//! | `{ns}:leases`          | hash   | job id → lease id of the current owner        |
//! | `{ns}:status`          | hash   | job id → status name                          |
//! | `{ns}:seq`             | string | insertion counter                             |
//!
//! Ready-set scores are `priority * TIER_WIDTH + eligible_at_ms`, so the
//! lowest score is the next job to serve. Members are `{seq:020}:{id}`:
//! Redis orders equal scores lexicographically, which keeps jobs submitted in
//! the same millisecond in FIFO order.
//!
//! The scripts touch several keys of one namespace, so a namespace must live
//! on a single Redis node.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::instrument;
use uuid::Uuid;

use crate::error::QueueError;
use crate::scheduler::job::{Job, JobStatus, Lease};

use super::{Backend, StatusCounts};

/// Width of one priority tier in the ready-set score space.
///
/// Millisecond timestamps stay below this until the year 2286, and the
/// largest score (`3 * TIER_WIDTH + ms`) is still exact in an `f64`.
pub const TIER_WIDTH: f64 = 1e13;

/// Length of the `{seq:020}:` prefix of a ready-set member.
const MEMBER_PREFIX_LEN: usize = 21;

/// Attempts made by `cancel_pending` when the record changes underneath it.
const CANCEL_ATTEMPTS: usize = 3;

const ENQUEUE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
local seq = redis.call('INCR', KEYS[5])
local member = string.format('%020d:%s', seq, ARGV[1])
redis.call('SET', KEYS[1], ARGV[2])
redis.call('HSET', KEYS[4], ARGV[1], 'pending')
redis.call('ZADD', KEYS[2], ARGV[3], member)
redis.call('HSET', KEYS[3], ARGV[1], member)
return 1
"#;

const CLAIM_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local width = tonumber(ARGV[2])
for tier = 0, 3 do
  local low = tier * width
  local hit = redis.call('ZRANGEBYSCORE', KEYS[1], low, low + now, 'LIMIT', 0, 1)
  if hit[1] then
    local member = hit[1]
    local id = string.sub(member, tonumber(ARGV[4]) + 1)
    redis.call('ZREM', KEYS[1], member)
    redis.call('HDEL', KEYS[2], id)
    redis.call('ZADD', KEYS[3], now, id)
    redis.call('HSET', KEYS[4], id, ARGV[3])
    redis.call('HSET', KEYS[5], id, 'processing')
    return id
  end
end
return false
"#;

const UPDATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return -1
end
local current = redis.call('HGET', KEYS[6], ARGV[1])
if current == 'completed' or current == 'failed' or current == 'cancelled' then
  return -2
end
local lease = redis.call('HGET', KEYS[5], ARGV[1])
if not lease then
  lease = ''
end
if lease ~= ARGV[4] then
  return -3
end
redis.call('SET', KEYS[1], ARGV[2])
redis.call('HSET', KEYS[6], ARGV[1], ARGV[3])
if ARGV[3] ~= 'processing' then
  redis.call('ZREM', KEYS[4], ARGV[1])
  redis.call('HDEL', KEYS[5], ARGV[1])
end
local old = redis.call('HGET', KEYS[3], ARGV[1])
if old then
  redis.call('ZREM', KEYS[2], old)
  redis.call('HDEL', KEYS[3], ARGV[1])
end
if ARGV[3] == 'pending' then
  local seq = redis.call('INCR', KEYS[7])
  local member = string.format('%020d:%s', seq, ARGV[1])
  redis.call('ZADD', KEYS[2], ARGV[5], member)
  redis.call('HSET', KEYS[3], ARGV[1], member)
end
return 1
"#;

const CANCEL_SCRIPT: &str = r#"
local member = redis.call('HGET', KEYS[3], ARGV[1])
if not member then
  return 0
end
if redis.call('GET', KEYS[1]) ~= ARGV[2] then
  return -1
end
redis.call('ZREM', KEYS[2], member)
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('SET', KEYS[1], ARGV[3])
redis.call('HSET', KEYS[4], ARGV[1], 'cancelled')
return 1
"#;

/// Returns the ready-set score of a pending job.
pub fn ready_score(job: &Job) -> f64 {
    job.priority.ordinal() as f64 * TIER_WIDTH + job.eligible_at.timestamp_millis() as f64
}

/// Shared, durable backend on top of Redis.
pub struct RedisBackend {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    namespace: String,
    ready_key: String,
    members_key: String,
    processing_key: String,
    leases_key: String,
    status_key: String,
    seq_key: String,
    enqueue_script: Script,
    claim_script: Script,
    update_script: Script,
    cancel_script: Script,
}

impl RedisBackend {
    /// Connects to Redis and uses `namespace` as the key prefix.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::BackendUnavailable` if the connection fails.
    pub async fn connect(redis_url: &str, namespace: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::BackendUnavailable(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::BackendUnavailable(e.to_string()))?;

        Ok(Self::from_connection(redis, namespace))
    }

    /// Creates a backend from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager, namespace: &str) -> Self {
        Self {
            redis,
            namespace: namespace.to_string(),
            ready_key: format!("{}:ready", namespace),
            members_key: format!("{}:members", namespace),
            processing_key: format!("{}:processing", namespace),
            leases_key: format!("{}:leases", namespace),
            status_key: format!("{}:status", namespace),
            seq_key: format!("{}:seq", namespace),
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            claim_script: Script::new(CLAIM_SCRIPT),
            update_script: Script::new(UPDATE_SCRIPT),
            cancel_script: Script::new(CANCEL_SCRIPT),
        }
    }

    /// Returns the key prefix.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn job_key(&self, id: Uuid) -> String {
        format!("{}:job:{}", self.namespace, id)
    }

    async fn read_record(&self, id: Uuid) -> Result<Option<(String, Job)>, QueueError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.get(self.job_key(id)).await?;

        match data {
            Some(raw) => {
                let job: Job = serde_json::from_str(&raw)?;
                Ok(Some((raw, job)))
            }
            None => Ok(None),
        }
    }

    async fn read_many(&self, ids: &[Uuid]) -> Result<Vec<Job>, QueueError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let keys: Vec<String> = ids.iter().map(|id| self.job_key(*id)).collect();
        let data: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

        let mut jobs = Vec::with_capacity(data.len());
        for raw in data.into_iter().flatten() {
            jobs.push(serde_json::from_str::<Job>(&raw)?);
        }
        Ok(jobs)
    }

    /// Runs the update script with `expected_lease` as the ownership check.
    async fn write_record(
        &self,
        job: &Job,
        expected_lease: Option<Uuid>,
    ) -> Result<(), QueueError> {
        let record = job.persisted();
        let serialized = serde_json::to_string(&record)?;
        let expected = expected_lease.map(|id| id.to_string()).unwrap_or_default();
        let mut conn = self.redis.clone();

        let code: i64 = self
            .update_script
            .key(self.job_key(job.id))
            .key(&self.ready_key)
            .key(&self.members_key)
            .key(&self.processing_key)
            .key(&self.leases_key)
            .key(&self.status_key)
            .key(&self.seq_key)
            .arg(job.id.to_string())
            .arg(serialized)
            .arg(record.status.as_str())
            .arg(expected)
            .arg(ready_score(&record))
            .invoke_async(&mut conn)
            .await?;

        match code {
            1 => Ok(()),
            -1 => Err(QueueError::NotFound(job.id)),
            -2 => {
                let current = self.current_status(job.id).await?;
                Err(QueueError::InvalidTransition {
                    id: job.id,
                    from: current.unwrap_or(JobStatus::Completed),
                    to: job.status,
                })
            }
            -3 => Err(QueueError::LeaseMismatch(job.id)),
            other => Err(QueueError::Backend(format!(
                "unexpected update script result {}",
                other
            ))),
        }
    }

    async fn current_status(&self, id: Uuid) -> Result<Option<JobStatus>, QueueError> {
        let mut conn = self.redis.clone();
        let status: Option<String> = conn.hget(&self.status_key, id.to_string()).await?;
        status.map(|s| s.parse()).transpose()
    }

    /// Deletes every key of this namespace.
    ///
    /// **Warning**: This permanently deletes all jobs. Use with caution.
    pub async fn clear(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn.hkeys(&self.status_key).await?;

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.del(format!("{}:job:{}", self.namespace, id));
        }
        pipe.del(&self.ready_key)
            .del(&self.members_key)
            .del(&self.processing_key)
            .del(&self.leases_key)
            .del(&self.status_key)
            .del(&self.seq_key);
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }
}

#[async_trait]
impl Backend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    #[instrument(skip_all, err, fields(job_id = %job.id))]
    async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        if job.status != JobStatus::Pending {
            return Err(QueueError::Validation(format!(
                "only pending jobs can be enqueued, got '{}'",
                job.status
            )));
        }

        let record = job.persisted();
        let serialized = serde_json::to_string(&record)?;
        let mut conn = self.redis.clone();

        let inserted: i64 = self
            .enqueue_script
            .key(self.job_key(record.id))
            .key(&self.ready_key)
            .key(&self.members_key)
            .key(&self.status_key)
            .key(&self.seq_key)
            .arg(record.id.to_string())
            .arg(serialized)
            .arg(ready_score(&record))
            .invoke_async(&mut conn)
            .await?;

        if inserted == 1 {
            Ok(())
        } else {
            Err(QueueError::Duplicate(record.id))
        }
    }

    #[instrument(skip_all, err)]
    async fn dequeue_next(&self) -> Result<Option<Job>, QueueError> {
        let now = Utc::now();
        let lease = Lease::new(now);
        let mut conn = self.redis.clone();

        let claimed: Option<String> = self
            .claim_script
            .key(&self.ready_key)
            .key(&self.members_key)
            .key(&self.processing_key)
            .key(&self.leases_key)
            .key(&self.status_key)
            .arg(now.timestamp_millis())
            .arg(TIER_WIDTH)
            .arg(lease.id.to_string())
            .arg(MEMBER_PREFIX_LEN)
            .invoke_async(&mut conn)
            .await?;

        let Some(raw_id) = claimed else {
            return Ok(None);
        };
        let id = Uuid::parse_str(&raw_id)
            .map_err(|e| QueueError::Backend(format!("corrupt job id '{}': {}", raw_id, e)))?;

        let (_, mut job) = self.read_record(id).await?.ok_or(QueueError::NotFound(id))?;
        let lease_id = lease.id;
        job.start(lease)?;
        self.write_record(&job, Some(lease_id)).await?;

        Ok(Some(job))
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, QueueError> {
        Ok(self.read_record(id).await?.map(|(_, job)| job))
    }

    #[instrument(skip_all, err, fields(job_id = %job.id, status = %job.status))]
    async fn update_job(&self, job: &Job) -> Result<(), QueueError> {
        // The status hash is authoritative; terminal and lease checks happen
        // again, atomically, inside the update script.
        let current = self
            .current_status(job.id)
            .await?
            .ok_or(QueueError::NotFound(job.id))?;
        if current != job.status && !current.can_transition_to(job.status) {
            return Err(QueueError::InvalidTransition {
                id: job.id,
                from: current,
                to: job.status,
            });
        }

        self.write_record(job, job.lease_id()).await
    }

    #[instrument(skip_all, err, fields(job_id = %id))]
    async fn cancel_pending(&self, id: Uuid) -> Result<bool, QueueError> {
        for _ in 0..CANCEL_ATTEMPTS {
            let (raw, mut job) = self.read_record(id).await?.ok_or(QueueError::NotFound(id))?;
            if job.status != JobStatus::Pending {
                return Ok(false);
            }
            job.cancel(Utc::now())?;
            let cancelled = serde_json::to_string(&job)?;

            let mut conn = self.redis.clone();
            let code: i64 = self
                .cancel_script
                .key(self.job_key(id))
                .key(&self.ready_key)
                .key(&self.members_key)
                .key(&self.status_key)
                .arg(id.to_string())
                .arg(raw)
                .arg(cancelled)
                .invoke_async(&mut conn)
                .await?;

            match code {
                1 => return Ok(true),
                0 => return Ok(false),
                _ => continue,
            }
        }

        tracing::warn!(job_id = %id, "Job record kept changing during cancellation");
        Ok(false)
    }

    async fn get_all_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>, QueueError> {
        let mut conn = self.redis.clone();
        let statuses: HashMap<String, String> = conn.hgetall(&self.status_key).await?;

        let ids: Vec<Uuid> = statuses
            .iter()
            .filter(|(_, s)| status.map_or(true, |wanted| wanted.as_str() == s.as_str()))
            .filter_map(|(id, _)| Uuid::parse_str(id).ok())
            .collect();

        let mut jobs = self.read_many(&ids).await?;
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn get_pending_count(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.zcard(&self.ready_key).await?;
        Ok(len)
    }

    async fn expired_leases(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, QueueError> {
        let mut conn = self.redis.clone();
        let expired: Vec<(String, f64)> = conn
            .zrangebyscore_withscores(
                &self.processing_key,
                "-inf",
                format!("({}", claimed_before.timestamp_millis()),
            )
            .await?;

        let mut jobs = Vec::with_capacity(expired.len());
        for (raw_id, claimed_ms) in expired {
            let Ok(id) = Uuid::parse_str(&raw_id) else {
                continue;
            };
            let Some((_, mut job)) = self.read_record(id).await? else {
                continue;
            };

            // A claim whose record was never rewritten still needs an owner
            // view, rebuilt from the leases hash.
            if job.status == JobStatus::Pending {
                let lease_id: Option<String> = conn.hget(&self.leases_key, &raw_id).await?;
                let Some(lease_id) = lease_id.and_then(|l| Uuid::parse_str(&l).ok()) else {
                    continue;
                };
                let claimed_at = Utc
                    .timestamp_millis_opt(claimed_ms as i64)
                    .single()
                    .unwrap_or(claimed_before);
                job.start(Lease {
                    id: lease_id,
                    claimed_at,
                    receipt: None,
                })?;
            }

            if job.status == JobStatus::Processing {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn status_counts(&self) -> Result<StatusCounts, QueueError> {
        let mut conn = self.redis.clone();
        let statuses: Vec<String> = conn.hvals(&self.status_key).await?;

        let mut counts = StatusCounts::default();
        for status in statuses {
            counts.record(status.parse()?);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{JobPriority, RenderPayload};

    fn job(priority: JobPriority) -> Job {
        Job::new(
            RenderPayload::new("t.html", serde_json::json!({"k": "v"}), "t.pdf"),
            priority,
        )
    }

    #[test]
    fn test_score_orders_by_tier_first() {
        let mut urgent = job(JobPriority::Urgent);
        let low = job(JobPriority::Low);
        urgent.eligible_at = low.eligible_at + chrono::Duration::days(365);

        assert!(ready_score(&urgent) < ready_score(&low));
    }

    #[test]
    fn test_score_orders_by_time_within_tier() {
        let early = job(JobPriority::High);
        let mut late = early.clone();
        late.eligible_at = early.eligible_at + chrono::Duration::milliseconds(1);

        assert!(ready_score(&early) < ready_score(&late));
        assert_eq!(ready_score(&late) - ready_score(&early), 1.0);
    }

    #[test]
    fn test_score_tier_boundaries() {
        let normal = job(JobPriority::Normal);
        let score = ready_score(&normal);

        assert!(score >= 2.0 * TIER_WIDTH);
        assert!(score < 3.0 * TIER_WIDTH);
    }

    #[test]
    fn test_member_prefix_length() {
        let id = Uuid::new_v4();
        let member = format!("{:020}:{}", 42, id);

        assert_eq!(member.find(':'), Some(MEMBER_PREFIX_LEN - 1));
        assert_eq!(&member[MEMBER_PREFIX_LEN..], id.to_string());
    }
}
