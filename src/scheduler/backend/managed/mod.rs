//! Managed message queue plus metadata side-table.
//!
//! This variant targets hosted queues with SQS-like semantics: a message is
//! hidden, not deleted, when received, and reappears once its visibility
//! timeout runs out unless the receiver deletes it. Such queues carry only a
//! job id; the full [`Job`] record lives in a separate [`MetadataStore`] that
//! supports conditional (versioned) writes.
//!
//! Both halves are traits so a hosted service can be plugged in. The crate
//! ships SQLite implementations ([`SqliteMessageQueue`],
//! [`SqliteMetadataStore`]) that reproduce the same semantics locally.
//!
//! # Known limitation: priority is best-effort
//!
//! The receive primitive returns messages roughly in send order and knows
//! nothing about job priority. `dequeue_next` therefore serves jobs in
//! message order, not strictly by tier, and
//! [`Backend::strict_priority`] returns `false`. Callers that need strict
//! ordering should use the memory or Redis backend.
//!
//! # Exclusive ownership
//!
//! The metadata store, not the message, decides who owns a job: a claim is a
//! compare-and-swap on the record version, so duplicate or reappearing
//! messages can never hand the same job to two workers.

mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::scheduler::job::{Job, JobStatus, Lease};

use super::{Backend, StatusCounts};

pub use sqlite::{SqliteMessageQueue, SqliteMetadataStore};

/// Messages inspected per `dequeue_next` call before reporting an empty queue.
const MAX_RECEIVES_PER_POLL: usize = 10;

/// Attempts made when a conditional write loses a race.
const CAS_ATTEMPTS: usize = 3;

/// Default time a received message stays hidden.
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

/// A message handed out by [`MessageQueue::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    /// Handle for `delete` / `change_visibility`; unique per receive.
    pub receipt: String,
    pub body: String,
    /// How many times the message has been received, this time included.
    pub receive_count: u32,
}

/// Receive-with-visibility-timeout queue primitive.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Sends a message that becomes visible after `delay`. Returns its id.
    async fn send(&self, body: &str, delay: Duration) -> Result<String, QueueError>;

    /// Receives one visible message and hides it for `visibility_timeout`.
    async fn receive(
        &self,
        visibility_timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError>;

    /// Deletes a received message.
    async fn delete(&self, receipt: &str) -> Result<(), QueueError>;

    /// Hides a received message for another `timeout`, starting now.
    async fn change_visibility(&self, receipt: &str, timeout: Duration)
        -> Result<(), QueueError>;

    /// Number of messages, visible or not.
    async fn approximate_len(&self) -> Result<usize, QueueError>;
}

/// Side-table holding full job records with versioned conditional writes.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Inserts a new record. Fails with `Duplicate` if the id exists.
    async fn insert(&self, job: &Job) -> Result<(), QueueError>;

    /// Removes a record, used to roll back a failed submission.
    async fn remove(&self, id: Uuid) -> Result<(), QueueError>;

    /// Reads a record together with its current version.
    async fn get_versioned(&self, id: Uuid) -> Result<Option<(Job, i64)>, QueueError>;

    /// Replaces the record only if its version is still `expected_version`.
    async fn compare_and_swap(&self, job: &Job, expected_version: i64)
        -> Result<bool, QueueError>;

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>, QueueError>;

    /// `Processing` records whose lease was taken before `cutoff`.
    async fn list_claimed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, QueueError>;

    async fn counts(&self) -> Result<StatusCounts, QueueError>;
}

/// Backend made of a [`MessageQueue`] and a [`MetadataStore`].
pub struct ManagedBackend<Q = SqliteMessageQueue, S = SqliteMetadataStore> {
    queue: Q,
    store: S,
    visibility_timeout: Duration,
}

impl ManagedBackend<SqliteMessageQueue, SqliteMetadataStore> {
    /// Opens both halves on one SQLite database.
    pub async fn open_sqlite(database_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let pool = sqlite::open_pool(database_url).await?;
        let queue = SqliteMessageQueue::new(pool.clone(), queue_name).await?;
        let store = SqliteMetadataStore::new(pool, queue_name).await?;

        tracing::info!(
            database_url = database_url,
            queue_name = queue_name,
            "Managed queue opened"
        );
        Ok(Self::new(queue, store))
    }
}

impl<Q: MessageQueue, S: MetadataStore> ManagedBackend<Q, S> {
    pub fn new(queue: Q, store: S) -> Self {
        Self {
            queue,
            store,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }

    /// Sets how long a received message stays hidden.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    async fn discard(&self, message: &ReceivedMessage, reason: &str) {
        tracing::debug!(
            message_id = %message.message_id,
            reason = reason,
            "Discarding stale queue message"
        );
        if let Err(e) = self.queue.delete(&message.receipt).await {
            warn!(message_id = %message.message_id, error = %e, "Failed to delete stale message");
        }
    }

    /// Tries to turn one received message into a claimed job.
    async fn claim_message(
        &self,
        message: ReceivedMessage,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        let Ok(id) = Uuid::parse_str(message.body.trim()) else {
            self.discard(&message, "unparseable body").await;
            return Ok(None);
        };
        let Some((mut job, version)) = self.store.get_versioned(id).await? else {
            self.discard(&message, "unknown job").await;
            return Ok(None);
        };

        match job.status {
            status if status.is_terminal() => {
                self.discard(&message, status.as_str()).await;
                Ok(None)
            }
            // Another copy of the message already handed the job out. Leave
            // this one hidden; it is deleted once the job finishes.
            JobStatus::Processing => Ok(None),
            _ if job.eligible_at > now => {
                let wait = (job.eligible_at - now).to_std().unwrap_or_default();
                self.queue.change_visibility(&message.receipt, wait).await?;
                Ok(None)
            }
            _ => {
                job.start(Lease::new(now).with_receipt(message.receipt.clone()))?;
                if self.store.compare_and_swap(&job, version).await? {
                    Ok(Some(job))
                } else {
                    Ok(None)
                }
            }
        }
    }
}

#[async_trait]
impl<Q: MessageQueue, S: MetadataStore> Backend for ManagedBackend<Q, S> {
    fn name(&self) -> &'static str {
        "managed"
    }

    fn strict_priority(&self) -> bool {
        false
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
        self.store.insert(&record).await?;

        let delay = (record.eligible_at - Utc::now()).to_std().unwrap_or_default();
        if let Err(e) = self.queue.send(&record.id.to_string(), delay).await {
            if let Err(rollback) = self.store.remove(record.id).await {
                warn!(job_id = %record.id, error = %rollback, "Failed to roll back job record");
            }
            return Err(e);
        }
        Ok(())
    }

    #[instrument(skip_all, err)]
    async fn dequeue_next(&self) -> Result<Option<Job>, QueueError> {
        for _ in 0..MAX_RECEIVES_PER_POLL {
            let Some(message) = self.queue.receive(self.visibility_timeout).await? else {
                return Ok(None);
            };
            if let Some(job) = self.claim_message(message, Utc::now()).await? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, QueueError> {
        Ok(self.store.get_versioned(id).await?.map(|(job, _)| job))
    }

    #[instrument(skip_all, err, fields(job_id = %job.id, status = %job.status))]
    async fn update_job(&self, job: &Job) -> Result<(), QueueError> {
        for _ in 0..CAS_ATTEMPTS {
            let (stored, version) = self
                .store
                .get_versioned(job.id)
                .await?
                .ok_or(QueueError::NotFound(job.id))?;
            stored.check_replacement(job)?;

            let record = job.persisted();
            if !self.store.compare_and_swap(&record, version).await? {
                continue;
            }

            let mut old_receipt = stored.lease.and_then(|lease| lease.receipt);
            if record.status == JobStatus::Pending {
                let delay = (record.eligible_at - Utc::now()).to_std().unwrap_or_default();
                if let Err(e) = self.queue.send(&record.id.to_string(), delay).await {
                    // The claimed message reappears after its visibility
                    // timeout and carries the retry instead.
                    warn!(job_id = %job.id, error = %e, "Failed to requeue job, keeping claimed message");
                    old_receipt = None;
                }
            }

            if let (Some(receipt), true) = (old_receipt, record.status != JobStatus::Processing) {
                if let Err(e) = self.queue.delete(&receipt).await {
                    warn!(job_id = %job.id, error = %e, "Failed to delete finished message");
                }
            }
            return Ok(());
        }

        Err(QueueError::Backend(format!(
            "job {} kept changing during update",
            job.id
        )))
    }

    #[instrument(skip_all, err, fields(job_id = %id))]
    async fn cancel_pending(&self, id: Uuid) -> Result<bool, QueueError> {
        for _ in 0..CAS_ATTEMPTS {
            let (mut job, version) = self
                .store
                .get_versioned(id)
                .await?
                .ok_or(QueueError::NotFound(id))?;
            if job.status != JobStatus::Pending {
                return Ok(false);
            }
            job.cancel(Utc::now())?;

            // The message stays in the queue and is discarded on receipt.
            if self.store.compare_and_swap(&job, version).await? {
                return Ok(true);
            }
        }

        Err(QueueError::Backend(format!(
            "job {} kept changing during cancel",
            id
        )))
    }

    async fn get_all_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>, QueueError> {
        self.store.list(status).await
    }

    async fn get_pending_count(&self) -> Result<usize, QueueError> {
        Ok(self.store.counts().await?.pending)
    }

    async fn expired_leases(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, QueueError> {
        self.store.list_claimed_before(claimed_before).await
    }

    async fn status_counts(&self) -> Result<StatusCounts, QueueError> {
        self.store.counts().await
    }
}
