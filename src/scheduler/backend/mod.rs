//! Pluggable job storage.
//!
//! Every backend implements the [`Backend`] trait and is selected once, at
//! construction time, from a [`BackendConfig`]:
//!
//! | Variant   | Type                 | Persistence            | Priority        |
//! |-----------|----------------------|------------------------|-----------------|
//! | `memory`  | [`MemoryBackend`]    | process lifetime       | strict          |
//! | `redis`   | [`RedisBackend`]     | shared, durable        | strict          |
//! | `managed` | [`ManagedBackend`]   | message queue + table  | best-effort     |
//!
//! # Concurrency contract
//!
//! [`Backend::dequeue_next`] is the only serialization point of the whole
//! pool: it atomically removes one eligible job from the ready set, moves it
//! to `Processing` under a fresh [`Lease`](super::job::Lease) and returns it.
//! Two concurrent calls never return the same job. Afterwards only the lease
//! holder may replace the record through [`Backend::update_job`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::BackendConfig;
use crate::error::QueueError;

use super::job::{Job, JobStatus};

pub mod managed;
pub mod memory;
pub mod redis;

pub use managed::{
    ManagedBackend, MessageQueue, MetadataStore, ReceivedMessage, SqliteMessageQueue,
    SqliteMetadataStore,
};
pub use memory::MemoryBackend;
pub use redis::RedisBackend;

/// Number of jobs per lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    /// Counts one job in `status`.
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }

    /// Builds counts from a job listing.
    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let mut counts = Self::default();
        for job in jobs {
            counts.record(job.status);
        }
        counts
    }

    /// Returns the number of jobs across all states.
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed + self.cancelled
    }
}

/// Storage contract shared by all backend variants.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short variant name, used in logs and metrics labels.
    fn name(&self) -> &'static str;

    /// Whether `dequeue_next` honours priority strictly.
    ///
    /// Backends built on a plain message queue can only approximate it.
    fn strict_priority(&self) -> bool {
        true
    }

    /// Inserts a new `Pending` job. Fails with `Duplicate` if the id exists.
    async fn enqueue(&self, job: Job) -> Result<(), QueueError>;

    /// Atomically claims the next eligible job, or returns `None` right away.
    ///
    /// Selection order is lowest priority ordinal first, then earliest
    /// `eligible_at` (submission or re-queue time). Jobs inside a retry
    /// backoff window are skipped. The returned job is already `Processing`
    /// and carries the caller's lease.
    async fn dequeue_next(&self) -> Result<Option<Job>, QueueError>;

    /// Reads the full record of a job.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, QueueError>;

    /// Replaces a job record on behalf of its lease holder.
    ///
    /// Fails with `NotFound` for unknown ids, `LeaseMismatch` when the caller
    /// no longer owns the job and `InvalidTransition` for terminal records
    /// or illegal edges. A `Pending` record re-enters the ready set at its
    /// `eligible_at`.
    async fn update_job(&self, job: &Job) -> Result<(), QueueError>;

    /// Cancels a job that is still waiting in the ready set.
    ///
    /// Returns `Ok(false)` when the job has already been claimed or finished.
    /// Races with `dequeue_next` are settled by the backend: whichever removes
    /// the job from the ready set first wins.
    async fn cancel_pending(&self, id: Uuid) -> Result<bool, QueueError>;

    /// Snapshot listing, optionally filtered by status.
    async fn get_all_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>, QueueError>;

    /// Number of jobs waiting in the ready set, including those in backoff.
    async fn get_pending_count(&self) -> Result<usize, QueueError>;

    /// Jobs whose lease was taken before `claimed_before`.
    async fn expired_leases(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, QueueError>;

    /// Number of jobs per status.
    async fn status_counts(&self) -> Result<StatusCounts, QueueError> {
        let jobs = self.get_all_jobs(None).await?;
        Ok(StatusCounts::from_jobs(&jobs))
    }
}

/// Builds the backend described by `config`.
///
/// `visibility_timeout` is only used by the managed variant, whose receive
/// primitive hides a message for that long.
pub async fn connect(
    config: &BackendConfig,
    visibility_timeout: Duration,
) -> Result<Arc<dyn Backend>, QueueError> {
    let backend: Arc<dyn Backend> = match config {
        BackendConfig::Memory => Arc::new(MemoryBackend::new()),
        BackendConfig::Redis { url, namespace } => {
            Arc::new(RedisBackend::connect(url, namespace).await?)
        }
        BackendConfig::Managed {
            database_url,
            queue_name,
        } => Arc::new(
            ManagedBackend::open_sqlite(database_url, queue_name)
                .await?
                .with_visibility_timeout(visibility_timeout),
        ),
    };

    tracing::info!(backend = backend.name(), "Job backend ready");
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{JobPriority, RenderPayload};

    #[test]
    fn test_status_counts() {
        let payload = RenderPayload::new("t", serde_json::json!({"a": 1}), "o.pdf");
        let mut done = Job::new(payload.clone(), JobPriority::Normal);
        done.status = JobStatus::Completed;
        let jobs = vec![
            Job::new(payload.clone(), JobPriority::Normal),
            Job::new(payload, JobPriority::Low),
            done,
        ];

        let counts = StatusCounts::from_jobs(&jobs);

        assert_eq!(counts.pending, 2);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.processing, 0);
        assert_eq!(counts.total(), 3);
    }

    #[tokio::test]
    async fn test_connect_memory() {
        let backend = connect(&BackendConfig::Memory, Duration::from_secs(30))
            .await
            .expect("memory backend always connects");

        assert_eq!(backend.name(), "memory");
        assert!(backend.strict_priority());
        assert_eq!(backend.get_pending_count().await.unwrap(), 0);
    }
}
