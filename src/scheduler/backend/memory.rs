//! In-process backend.
//!
//! All state lives behind a single `tokio::sync::Mutex`, which makes every
//! operation (and in particular claim-vs-cancel) trivially atomic. Data is
//! lost when the process exits.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

use crate::error::QueueError;
use crate::scheduler::job::{Job, JobPriority, JobStatus, Lease};

use super::{Backend, StatusCounts};

/// Ready-set ordering: tier, then eligibility time, then insertion order.
type ReadyKey = (JobPriority, DateTime<Utc>, u64);

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<Uuid, Job>,
    ready: BTreeMap<ReadyKey, Uuid>,
    ready_index: HashMap<Uuid, ReadyKey>,
    next_seq: u64,
}

impl MemoryState {
    fn push_ready(&mut self, job: &Job) {
        let key = (job.priority, job.eligible_at, self.next_seq);
        self.next_seq += 1;
        self.ready.insert(key, job.id);
        self.ready_index.insert(job.id, key);
    }

    fn remove_ready(&mut self, id: Uuid) -> bool {
        match self.ready_index.remove(&id) {
            Some(key) => self.ready.remove(&key).is_some(),
            None => false,
        }
    }

    /// Head of the first tier whose head is eligible.
    ///
    /// Within a tier keys are sorted by `eligible_at`, so if the head is still
    /// backing off every later entry in that tier is too.
    fn next_eligible(&self, now: DateTime<Utc>) -> Option<Uuid> {
        JobPriority::ALL.into_iter().find_map(|priority| {
            let lower = (priority, DateTime::<Utc>::MIN_UTC, 0);
            self.ready
                .range(lower..)
                .next()
                .filter(|((p, eligible_at, _), _)| *p == priority && *eligible_at <= now)
                .map(|(_, id)| *id)
        })
    }
}

/// Ephemeral, single-process backend.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    #[instrument(skip_all, err, fields(job_id = %job.id))]
    async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        if job.status != JobStatus::Pending {
            return Err(QueueError::Validation(format!(
                "only pending jobs can be enqueued, got '{}'",
                job.status
            )));
        }

        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&job.id) {
            return Err(QueueError::Duplicate(job.id));
        }

        let record = job.persisted();
        state.push_ready(&record);
        state.jobs.insert(record.id, record);
        Ok(())
    }

    #[instrument(skip_all, err)]
    async fn dequeue_next(&self) -> Result<Option<Job>, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let Some(id) = state.next_eligible(now) else {
            return Ok(None);
        };
        state.remove_ready(id);

        let job = state.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        job.start(Lease::new(now))?;
        Ok(Some(job.clone()))
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&id).cloned())
    }

    #[instrument(skip_all, err, fields(job_id = %job.id, status = %job.status))]
    async fn update_job(&self, job: &Job) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;

        let stored = state.jobs.get(&job.id).ok_or(QueueError::NotFound(job.id))?;
        stored.check_replacement(job)?;

        let record = job.persisted();
        state.remove_ready(record.id);
        if record.status == JobStatus::Pending {
            state.push_ready(&record);
        }
        state.jobs.insert(record.id, record);
        Ok(())
    }

    #[instrument(skip_all, err, fields(job_id = %id))]
    async fn cancel_pending(&self, id: Uuid) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;

        let job = state.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if job.status != JobStatus::Pending {
            return Ok(false);
        }
        job.cancel(Utc::now())?;
        state.remove_ready(id);
        Ok(true)
    }

    async fn get_all_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>, QueueError> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| status.map_or(true, |s| job.status == s))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn get_pending_count(&self) -> Result<usize, QueueError> {
        Ok(self.state.lock().await.ready.len())
    }

    async fn expired_leases(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, QueueError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Processing
                    && job
                        .lease
                        .as_ref()
                        .is_some_and(|lease| lease.claimed_at < claimed_before)
            })
            .cloned()
            .collect())
    }

    async fn status_counts(&self) -> Result<StatusCounts, QueueError> {
        let state = self.state.lock().await;
        Ok(StatusCounts::from_jobs(state.jobs.values()))
    }
}
