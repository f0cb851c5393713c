//! Caller-facing queue facade.
//!
//! A [`QueueManager`] owns one backend and one worker pool. It is an explicit
//! object: create it once, share it behind an `Arc`, and every method takes
//! `&self`.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::renderer::Renderer;

use super::backend::{self, Backend, MemoryBackend};
use super::hooks::HookRegistry;
use super::job::{Job, JobPriority, JobRequest, JobStatus, DEFAULT_MAX_RETRIES};
use super::retry::RetryPolicy;
use super::worker_pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};

/// Default interval between status checks in [`QueueManager::wait_for_job`].
pub const DEFAULT_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Snapshot returned by [`QueueManager::get_queue_stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Configured pool size.
    pub workers: usize,
    /// Whether the pool is started.
    pub running: bool,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed + self.cancelled
    }
}

/// Submission, query and lifecycle entry point.
pub struct QueueManager {
    backend: Arc<dyn Backend>,
    pool: WorkerPool,
    default_max_retries: u32,
}

impl QueueManager {
    pub fn builder() -> QueueManagerBuilder {
        QueueManagerBuilder::default()
    }

    /// Connects the configured backend and prepares a stopped pool.
    pub async fn from_config(
        config: &QueueConfig,
        renderer: Arc<dyn Renderer>,
        hooks: HookRegistry,
    ) -> Result<Self, QueueError> {
        let pool_config = config.worker_pool_config();
        let backend = backend::connect(&config.backend, pool_config.visibility_timeout).await?;

        Self::builder()
            .backend(backend)
            .renderer(renderer)
            .hooks(hooks)
            .pool_config(pool_config)
            .retry_policy(config.retry_policy())
            .default_max_retries(config.default_max_retries)
            .build()
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    fn build_job(
        &self,
        request: &JobRequest,
        default_priority: JobPriority,
    ) -> Result<Job, QueueError> {
        let payload = request.payload();
        payload.validate()?;

        let priority = request.priority.unwrap_or(default_priority);
        let max_retries = request.max_retries.unwrap_or(self.default_max_retries);
        Ok(Job::new(payload, priority)
            .with_max_retries(max_retries)
            .with_metadata(request.metadata.clone()))
    }

    /// Validates and enqueues a new `Pending` job. Returns immediately.
    ///
    /// Unset fields default to `Normal` priority and the configured
    /// `max_retries`.
    #[instrument(skip_all, err, fields(template = %request.template))]
    pub async fn submit_job(&self, request: JobRequest) -> Result<Uuid, QueueError> {
        let job = self.build_job(&request, JobPriority::Normal)?;
        let id = job.id;
        let priority = job.priority;

        self.backend.enqueue(job).await?;

        info!(job_id = %id, priority = %priority, "Job submitted");
        Ok(id)
    }

    /// Submits several jobs. One failed submission does not stop the others.
    ///
    /// A job's own priority wins over `default_priority`.
    pub async fn submit_batch(
        &self,
        requests: Vec<JobRequest>,
        default_priority: Option<JobPriority>,
    ) -> Vec<Result<Uuid, QueueError>> {
        let default_priority = default_priority.unwrap_or_default();
        let mut results = Vec::with_capacity(requests.len());

        for request in &requests {
            let result = match self.build_job(request, default_priority) {
                Ok(job) => {
                    let id = job.id;
                    self.backend.enqueue(job).await.map(|()| id)
                }
                Err(e) => Err(e),
            };
            results.push(result);
        }

        let accepted = results.iter().filter(|r| r.is_ok()).count();
        info!(
            submitted = requests.len(),
            accepted = accepted,
            "Batch submitted"
        );
        results
    }

    /// Returns the current status, or `NotFound`.
    pub async fn get_job_status(&self, id: Uuid) -> Result<JobStatus, QueueError> {
        self.backend
            .get_job(id)
            .await?
            .map(|job| job.status)
            .ok_or(QueueError::NotFound(id))
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Option<Job>, QueueError> {
        self.backend.get_job(id).await
    }

    /// Polls until the job is terminal.
    ///
    /// Returns the job once `Completed`. A `Failed` job yields `JobFailed`
    /// carrying its error, a `Cancelled` one `JobCancelled`, and running out
    /// of `timeout` yields `WaitTimeout`. `None` waits indefinitely. No lock
    /// is held between polls.
    pub async fn wait_for_job(
        &self,
        id: Uuid,
        timeout: Option<Duration>,
        poll_interval: Duration,
    ) -> Result<Job, QueueError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let poll_interval = poll_interval.max(Duration::from_millis(1));

        loop {
            let job = self
                .backend
                .get_job(id)
                .await?
                .ok_or(QueueError::NotFound(id))?;

            match job.status {
                JobStatus::Completed => return Ok(job),
                JobStatus::Failed => {
                    return Err(QueueError::JobFailed {
                        id,
                        error: job.error.unwrap_or_default(),
                    })
                }
                JobStatus::Cancelled => return Err(QueueError::JobCancelled(id)),
                JobStatus::Pending | JobStatus::Processing => {}
            }

            let sleep_for = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(QueueError::WaitTimeout {
                            id,
                            timeout: timeout.unwrap_or_default(),
                        });
                    }
                    poll_interval.min(deadline - now)
                }
                None => poll_interval,
            };
            debug!(job_id = %id, status = %job.status, "Waiting for job");
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Cancels a job nobody has claimed yet.
    ///
    /// Returns `false` if the job is already processing or finished. Unknown
    /// ids yield `NotFound`.
    pub async fn cancel_job(&self, id: Uuid) -> Result<bool, QueueError> {
        let cancelled = self.backend.cancel_pending(id).await?;
        if cancelled {
            info!(job_id = %id, "Job cancelled");
        } else {
            debug!(job_id = %id, "Job not cancellable");
        }
        Ok(cancelled)
    }

    /// Starts the worker pool.
    pub async fn start(&self) -> Result<(), PoolError> {
        self.pool.start().await
    }

    /// Stops the worker pool, waiting up to `timeout` (or the configured
    /// shutdown timeout) for in-flight renders to finish.
    ///
    /// Queries and stats stay available while the pool drains.
    pub async fn stop(&self, timeout: Option<Duration>) -> Result<(), PoolError> {
        match timeout {
            Some(timeout) => self.pool.shutdown_with_timeout(timeout).await,
            None => self.pool.shutdown().await,
        }
    }

    pub fn is_running(&self) -> bool {
        self.pool.is_running()
    }

    /// Per-status job counts plus pool size and state.
    pub async fn get_queue_stats(&self) -> Result<QueueStats, QueueError> {
        let counts = self.backend.status_counts().await?;

        Ok(QueueStats {
            pending: counts.pending,
            processing: counts.processing,
            completed: counts.completed,
            failed: counts.failed,
            cancelled: counts.cancelled,
            workers: self.pool.num_workers(),
            running: self.pool.is_running(),
        })
    }

    /// Counters kept by this process's workers.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

/// Builder for [`QueueManager`].
///
/// Only the renderer is required; the backend defaults to an in-memory one.
#[derive(Default)]
pub struct QueueManagerBuilder {
    backend: Option<Arc<dyn Backend>>,
    renderer: Option<Arc<dyn Renderer>>,
    hooks: HookRegistry,
    pool_config: WorkerPoolConfig,
    retry_policy: RetryPolicy,
    default_max_retries: Option<u32>,
}

impl QueueManagerBuilder {
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn pool_config(mut self, config: WorkerPoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.pool_config.num_workers = num_workers;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = Some(max_retries);
        self
    }

    pub fn build(self) -> Result<QueueManager, QueueError> {
        let renderer = self
            .renderer
            .ok_or_else(|| QueueError::Config("a renderer is required".to_string()))?;
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(MemoryBackend::new()));

        let pool = WorkerPool::with_parts(
            self.pool_config,
            Arc::clone(&backend),
            renderer,
            Arc::new(self.hooks),
            self.retry_policy,
        );

        Ok(QueueManager {
            backend,
            pool,
            default_max_retries: self.default_max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::RenderError;
    use crate::scheduler::job::RenderPayload;
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::PathBuf;

    struct NoopRenderer;

    #[async_trait]
    impl Renderer for NoopRenderer {
        async fn render(&self, payload: &RenderPayload) -> Result<PathBuf, RenderError> {
            Ok(PathBuf::from(&payload.output_filename))
        }
    }

    fn manager() -> QueueManager {
        QueueManager::builder()
            .renderer(Arc::new(NoopRenderer))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_renderer() {
        let err = QueueManager::builder().build().err().unwrap();
        assert!(matches!(err, QueueError::Config(_)));
    }

    #[tokio::test]
    async fn test_submit_defaults() {
        let manager = manager();
        let id = manager
            .submit_job(JobRequest::new("t", json!({"a": 1}), "a.pdf"))
            .await
            .unwrap();

        let job = manager.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.priority, JobPriority::Normal);
        assert_eq!(job.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(manager.get_job_status(id).await.unwrap(), JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_submit_rejects_missing_fields() {
        let manager = manager();

        for request in [
            JobRequest::new("", json!({"a": 1}), "a.pdf"),
            JobRequest::new("t", json!({}), "a.pdf"),
            JobRequest::new("t", json!({"a": 1}), " "),
        ] {
            let err = manager.submit_job(request).await.unwrap_err();
            assert!(matches!(err, QueueError::Validation(_)));
        }
        assert_eq!(manager.get_queue_stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_submit_batch_priorities_and_partial_failure() {
        let manager = manager();
        let results = manager
            .submit_batch(
                vec![
                    JobRequest::new("t", json!({"a": 1}), "a.pdf"),
                    JobRequest::new("t", json!(null), "b.pdf"),
                    JobRequest::new("t", json!({"c": 1}), "c.pdf").with_priority(JobPriority::Urgent),
                ],
                Some(JobPriority::Low),
            )
            .await;

        assert_eq!(results.len(), 3);
        let first = manager.get_job(*results[0].as_ref().unwrap()).await.unwrap().unwrap();
        assert_eq!(first.priority, JobPriority::Low);
        assert!(matches!(results[1], Err(QueueError::Validation(_))));
        let third = manager.get_job(*results[2].as_ref().unwrap()).await.unwrap().unwrap();
        assert_eq!(third.priority, JobPriority::Urgent);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let manager = manager();
        let id = Uuid::new_v4();

        assert!(matches!(
            manager.get_job_status(id).await,
            Err(QueueError::NotFound(_))
        ));
        assert!(manager.get_job(id).await.unwrap().is_none());
        assert!(matches!(
            manager.wait_for_job(id, None, Duration::from_millis(5)).await,
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_timeout_without_workers() {
        let manager = manager();
        let id = manager
            .submit_job(JobRequest::new("t", json!({"a": 1}), "a.pdf"))
            .await
            .unwrap();

        let err = manager
            .wait_for_job(id, Some(Duration::from_millis(50)), Duration::from_millis(10))
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::WaitTimeout { id: waited, .. } if waited == id));
    }

    #[tokio::test]
    async fn test_wait_for_cancelled_job() {
        let manager = manager();
        let id = manager
            .submit_job(JobRequest::new("t", json!({"a": 1}), "a.pdf"))
            .await
            .unwrap();

        assert!(manager.cancel_job(id).await.unwrap());
        assert!(!manager.cancel_job(id).await.unwrap());

        let err = manager
            .wait_for_job(id, Some(Duration::from_secs(1)), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::JobCancelled(_)));
    }

    #[tokio::test]
    async fn test_queue_stats_reports_pool_state() {
        let manager = QueueManager::builder()
            .renderer(Arc::new(NoopRenderer))
            .num_workers(3)
            .build()
            .unwrap();

        let stats = manager.get_queue_stats().await.unwrap();
        assert_eq!(stats.workers, 3);
        assert!(!stats.running);

        manager.start().await.unwrap();
        assert!(manager.get_queue_stats().await.unwrap().running);
        manager.stop(Some(Duration::from_secs(5))).await.unwrap();
        assert!(!manager.is_running());
    }
}
