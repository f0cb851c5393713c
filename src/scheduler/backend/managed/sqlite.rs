//! SQLite implementations of the managed-queue primitives.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::QueueError;
use crate::scheduler::backend::StatusCounts;
use crate::scheduler::job::{Job, JobStatus};

use super::{MessageQueue, MetadataStore, ReceivedMessage};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS queue_messages (
    message_id      TEXT    PRIMARY KEY,
    queue           TEXT    NOT NULL,
    body            TEXT    NOT NULL,
    sent_at         INTEGER NOT NULL,
    visible_at      INTEGER NOT NULL,
    receive_count   INTEGER NOT NULL DEFAULT 0,
    receipt         TEXT
);

CREATE INDEX IF NOT EXISTS idx_queue_messages_visible ON queue_messages(queue, visible_at);
CREATE INDEX IF NOT EXISTS idx_queue_messages_receipt ON queue_messages(receipt);

CREATE TABLE IF NOT EXISTS render_jobs (
    job_id          TEXT    PRIMARY KEY,
    queue           TEXT    NOT NULL,
    status          TEXT    NOT NULL,
    priority        INTEGER NOT NULL,
    claimed_at      INTEGER,
    version         INTEGER NOT NULL DEFAULT 0,
    record          TEXT    NOT NULL,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_render_jobs_status ON render_jobs(queue, status);
CREATE INDEX IF NOT EXISTS idx_render_jobs_claimed ON render_jobs(queue, claimed_at);
"#;

/// Opens a pool and creates both tables.
///
/// Accepts either a `sqlite:` URL or a plain file path.
pub(super) async fn open_pool(database_url: &str) -> Result<SqlitePool, QueueError> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite://{}", database_url)
    };
    let in_memory = url.contains(":memory:");

    let opts = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));

    // Every connection to `:memory:` gets its own database, so keep exactly one alive.
    let pool = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?
    };

    sqlx::query(SCHEMA_SQL).execute(&pool).await?;
    Ok(pool)
}

fn millis_after(now: DateTime<Utc>, delay: Duration) -> i64 {
    now.timestamp_millis()
        .saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))
}

/// Message queue stored in the `queue_messages` table.
#[derive(Clone)]
pub struct SqliteMessageQueue {
    pool: SqlitePool,
    queue: String,
}

impl SqliteMessageQueue {
    pub async fn new(pool: SqlitePool, queue: &str) -> Result<Self, QueueError> {
        sqlx::query(SCHEMA_SQL).execute(&pool).await?;
        Ok(Self {
            pool,
            queue: queue.to_string(),
        })
    }

    pub async fn open(database_url: &str, queue: &str) -> Result<Self, QueueError> {
        let pool = open_pool(database_url).await?;
        Self::new(pool, queue).await
    }
}

#[async_trait]
impl MessageQueue for SqliteMessageQueue {
    async fn send(&self, body: &str, delay: Duration) -> Result<String, QueueError> {
        let now = Utc::now();
        let message_id = Uuid::new_v4().to_string();

        sqlx::query(
            "INSERT INTO queue_messages (message_id, queue, body, sent_at, visible_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&message_id)
        .bind(&self.queue)
        .bind(body)
        .bind(now.timestamp_millis())
        .bind(millis_after(now, delay))
        .execute(&self.pool)
        .await?;

        Ok(message_id)
    }

    async fn receive(
        &self,
        visibility_timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError> {
        let now = Utc::now();
        let receipt = Uuid::new_v4().to_string();

        let row = sqlx::query(
            "UPDATE queue_messages
             SET visible_at = ?1, receive_count = receive_count + 1, receipt = ?2
             WHERE message_id = (
                 SELECT message_id FROM queue_messages
                 WHERE queue = ?3 AND visible_at <= ?4
                 ORDER BY visible_at, sent_at
                 LIMIT 1
             )
             RETURNING message_id, body, receive_count",
        )
        .bind(millis_after(now, visibility_timeout))
        .bind(&receipt)
        .bind(&self.queue)
        .bind(now.timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ReceivedMessage {
            message_id: row.get("message_id"),
            receipt,
            body: row.get("body"),
            receive_count: row.get::<i64, _>("receive_count").max(0) as u32,
        }))
    }

    async fn delete(&self, receipt: &str) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM queue_messages WHERE queue = ?1 AND receipt = ?2")
            .bind(&self.queue)
            .bind(receipt)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn change_visibility(
        &self,
        receipt: &str,
        timeout: Duration,
    ) -> Result<(), QueueError> {
        sqlx::query("UPDATE queue_messages SET visible_at = ?1 WHERE queue = ?2 AND receipt = ?3")
            .bind(millis_after(Utc::now(), timeout))
            .bind(&self.queue)
            .bind(receipt)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn approximate_len(&self) -> Result<usize, QueueError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages WHERE queue = ?1")
            .bind(&self.queue)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }
}

/// Job records stored in the `render_jobs` table.
#[derive(Clone)]
pub struct SqliteMetadataStore {
    pool: SqlitePool,
    queue: String,
}

impl SqliteMetadataStore {
    pub async fn new(pool: SqlitePool, queue: &str) -> Result<Self, QueueError> {
        sqlx::query(SCHEMA_SQL).execute(&pool).await?;
        Ok(Self {
            pool,
            queue: queue.to_string(),
        })
    }

    pub async fn open(database_url: &str, queue: &str) -> Result<Self, QueueError> {
        let pool = open_pool(database_url).await?;
        Self::new(pool, queue).await
    }

    fn decode_records(rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<Job>, QueueError> {
        rows.iter()
            .map(|row| Ok(serde_json::from_str(row.get::<&str, _>("record"))?))
            .collect()
    }
}

fn claimed_at_millis(job: &Job) -> Option<i64> {
    match job.status {
        JobStatus::Processing => job.lease.as_ref().map(|l| l.claimed_at.timestamp_millis()),
        _ => None,
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn insert(&self, job: &Job) -> Result<(), QueueError> {
        let record = serde_json::to_string(job)?;
        let now = Utc::now().timestamp_millis();

        let result = sqlx::query(
            "INSERT INTO render_jobs (
                job_id, queue, status, priority, claimed_at, version, record,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8)
            ON CONFLICT(job_id) DO NOTHING",
        )
        .bind(job.id.to_string())
        .bind(&self.queue)
        .bind(job.status.as_str())
        .bind(i64::from(job.priority.ordinal()))
        .bind(claimed_at_millis(job))
        .bind(record)
        .bind(job.created_at.timestamp_millis())
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::Duplicate(job.id));
        }
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM render_jobs WHERE job_id = ?1 AND queue = ?2")
            .bind(id.to_string())
            .bind(&self.queue)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_versioned(&self, id: Uuid) -> Result<Option<(Job, i64)>, QueueError> {
        let row = sqlx::query("SELECT record, version FROM render_jobs WHERE job_id = ?1 AND queue = ?2")
            .bind(id.to_string())
            .bind(&self.queue)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let job: Job = serde_json::from_str(row.get::<&str, _>("record"))?;
                Ok(Some((job, row.get("version"))))
            }
            None => Ok(None),
        }
    }

    async fn compare_and_swap(&self, job: &Job, expected_version: i64) -> Result<bool, QueueError> {
        let record = serde_json::to_string(job)?;

        let result = sqlx::query(
            "UPDATE render_jobs
             SET status = ?1, priority = ?2, claimed_at = ?3, record = ?4,
                 version = version + 1, updated_at = ?5
             WHERE job_id = ?6 AND queue = ?7 AND version = ?8",
        )
        .bind(job.status.as_str())
        .bind(i64::from(job.priority.ordinal()))
        .bind(claimed_at_millis(job))
        .bind(record)
        .bind(Utc::now().timestamp_millis())
        .bind(job.id.to_string())
        .bind(&self.queue)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>, QueueError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT record FROM render_jobs WHERE queue = ?1 AND status = ?2
                     ORDER BY created_at",
                )
                .bind(&self.queue)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT record FROM render_jobs WHERE queue = ?1 ORDER BY created_at")
                    .bind(&self.queue)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Self::decode_records(rows)
    }

    async fn list_claimed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, QueueError> {
        let rows = sqlx::query(
            "SELECT record FROM render_jobs
             WHERE queue = ?1 AND status = 'processing' AND claimed_at < ?2
             ORDER BY claimed_at",
        )
        .bind(&self.queue)
        .bind(cutoff.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        Self::decode_records(rows)
    }

    async fn counts(&self) -> Result<StatusCounts, QueueError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM render_jobs WHERE queue = ?1 GROUP BY status",
        )
        .bind(&self.queue)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let n = row.get::<i64, _>("n").max(0) as usize;
            match row.get::<&str, _>("status").parse::<JobStatus>() {
                Ok(JobStatus::Pending) => counts.pending += n,
                Ok(JobStatus::Processing) => counts.processing += n,
                Ok(JobStatus::Completed) => counts.completed += n,
                Ok(JobStatus::Failed) => counts.failed += n,
                Ok(JobStatus::Cancelled) => counts.cancelled += n,
                Err(e) => tracing::warn!(error = %e, "Skipping unknown status in job table"),
            }
        }
        Ok(counts)
    }
}
