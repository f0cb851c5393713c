//! Worker pool for processing render jobs from a shared backend.
//!
//! This module provides a fixed pool of workers that pull jobs from a
//! [`Backend`]. Each worker runs as an independent async task, claims one job
//! at a time through [`Backend::dequeue_next`] and hands its payload to the
//! [`Renderer`].
//!
//! # Features
//!
//! - Configurable number of workers
//! - Graceful shutdown with broadcast channel
//! - Retry with capped exponential backoff
//! - Stuck-job reclamation after the visibility timeout
//! - Pool statistics tracking

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::QueueError;
use crate::metrics::{JobOutcome, MetricsCollector};
use crate::renderer::{RenderError, Renderer};

use super::backend::Backend;
use super::hooks::{panic_message, HookContext, HookRegistry};
use super::job::{AttemptOutcome, Job};
use super::retry::RetryPolicy;

/// Error recorded on jobs taken back from a silent worker.
pub const RECLAIM_ERROR: &str = "visibility timeout exceeded";

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The backend rejected a pool-level operation.
    #[error("Backend error: {0}")]
    Backend(#[from] QueueError),

    /// The configuration cannot run a pool.
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// How long an idle worker sleeps before polling again.
    pub poll_interval: Duration,
    /// How long a job may stay claimed without an update before it is reclaimed.
    pub visibility_timeout: Duration,
    /// How often the reaper looks for expired leases.
    pub reclaim_interval: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Upper bound of the backoff applied after backend failures.
    pub backend_retry_max: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            poll_interval: Duration::from_millis(500),
            visibility_timeout: Duration::from_secs(300),
            reclaim_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(60),
            backend_retry_max: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the visibility timeout.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Sets the reaper interval.
    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the backend failure backoff cap.
    pub fn with_backend_retry_max(mut self, max: Duration) -> Self {
        self.backend_retry_max = max;
        self
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.num_workers == 0 {
            return Err(PoolError::InvalidConfig(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(PoolError::InvalidConfig(
                "poll_interval must be greater than zero".to_string(),
            ));
        }
        if self.visibility_timeout.is_zero() {
            return Err(PoolError::InvalidConfig(
                "visibility_timeout must be greater than zero".to_string(),
            ));
        }
        if self.reclaim_interval.is_zero() {
            return Err(PoolError::InvalidConfig(
                "reclaim_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of the counters kept by one pool.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct PoolStats {
    pub num_workers: usize,
    /// Workers currently inside a render.
    pub active_workers: usize,
    pub jobs_completed: u64,
    /// Jobs that failed for good.
    pub jobs_failed: u64,
    /// Failed attempts that were scheduled for another try.
    pub jobs_retried: u64,
    /// Jobs taken back from workers whose lease expired.
    pub jobs_reclaimed: u64,
    /// Mean render time over every recorded attempt.
    pub average_render: Duration,
}

/// Live counters behind [`PoolStats`].
#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    reclaimed: AtomicU64,
    render_ms: AtomicU64,
    active: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: JobOutcome, duration: Duration) {
        let counter = match outcome {
            JobOutcome::Completed => &self.completed,
            JobOutcome::Retried => &self.retried,
            JobOutcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.render_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn snapshot(&self, num_workers: usize) -> PoolStats {
        let completed = self.completed.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let retried = self.retried.load(Ordering::SeqCst);
        let attempts = completed + failed + retried;

        PoolStats {
            num_workers,
            active_workers: self.active.load(Ordering::SeqCst) as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            jobs_retried: retried,
            jobs_reclaimed: self.reclaimed.load(Ordering::SeqCst),
            average_render: match attempts {
                0 => Duration::ZERO,
                n => Duration::from_millis(self.render_ms.load(Ordering::SeqCst) / n),
            },
        }
    }
}

/// Counts one render as in progress until dropped, unwinding included.
struct InFlight<'a> {
    ctx: &'a PoolContext,
}

impl<'a> InFlight<'a> {
    fn enter(ctx: &'a PoolContext) -> Self {
        ctx.counters.active.fetch_add(1, Ordering::SeqCst);
        ctx.metrics.inc_jobs_in_progress();
        Self { ctx }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.ctx.counters.active.fetch_sub(1, Ordering::SeqCst);
        self.ctx.metrics.dec_jobs_in_progress();
    }
}

/// Everything a worker or the reaper needs, shared behind one `Arc`.
struct PoolContext {
    config: WorkerPoolConfig,
    backend: Arc<dyn Backend>,
    renderer: Arc<dyn Renderer>,
    hooks: Arc<HookRegistry>,
    retry_policy: RetryPolicy,
    counters: Arc<Counters>,
    metrics: MetricsCollector,
}

impl PoolContext {
    /// Returns every job whose lease is older than the visibility timeout to
    /// `Pending` (consuming one retry) or fails it when none remain.
    async fn reclaim_expired(&self) -> Result<usize, QueueError> {
        let now = Utc::now();
        let timeout_ms = i64::try_from(self.config.visibility_timeout.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now - chrono::Duration::milliseconds(timeout_ms);

        let mut reclaimed = 0;
        for mut job in self.backend.expired_leases(cutoff).await? {
            let outcome = match job.record_failure(RECLAIM_ERROR, true, &self.retry_policy, now) {
                Ok(outcome) => outcome,
                Err(e) => {
                    debug!(job_id = %job.id, error = %e, "Skipping expired lease");
                    continue;
                }
            };

            match self.backend.update_job(&job).await {
                Ok(()) => {
                    reclaimed += 1;
                    self.counters.reclaimed.fetch_add(1, Ordering::SeqCst);
                    self.metrics.record_reclaimed();
                    warn!(
                        job_id = %job.id,
                        retry_count = job.retry_count,
                        status = %job.status,
                        "Reclaimed stuck job"
                    );
                    if outcome == AttemptOutcome::Failed {
                        self.counters.record(JobOutcome::Failed, Duration::ZERO);
                        self.hooks
                            .run_on_error(RECLAIM_ERROR, &HookContext::new(&job, "reaper"));
                    }
                }
                // The worker finished (or another reaper won) in the meantime.
                Err(QueueError::LeaseMismatch(_)) | Err(QueueError::InvalidTransition { .. }) => {
                    debug!(job_id = %job.id, "Expired lease resolved concurrently");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(reclaimed)
    }
}

/// Fixed set of workers plus a reaper, all sharing one backend.
///
/// Every method takes `&self`. Start and shutdown are serialized on the task
/// list; state and counters are plain atomics, so reading them never waits
/// for a draining shutdown.
pub struct WorkerPool {
    ctx: Arc<PoolContext>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a stopped pool with default hooks and retry policy.
    pub fn new(
        config: WorkerPoolConfig,
        backend: Arc<dyn Backend>,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        Self::with_parts(
            config,
            backend,
            renderer,
            Arc::new(HookRegistry::default()),
            RetryPolicy::default(),
        )
    }

    pub fn with_parts(
        config: WorkerPoolConfig,
        backend: Arc<dyn Backend>,
        renderer: Arc<dyn Renderer>,
        hooks: Arc<HookRegistry>,
        retry_policy: RetryPolicy,
    ) -> Self {
        // Buffer size of 1 is sufficient since we only send once per run
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            ctx: Arc::new(PoolContext {
                config,
                backend,
                renderer,
                hooks,
                retry_policy,
                counters: Arc::new(Counters::default()),
                metrics: MetricsCollector::new(),
            }),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers and the reaper.
    ///
    /// Before spawning, one reclamation pass returns jobs left `Processing`
    /// by a previous run whose lease has expired.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&self) -> Result<(), PoolError> {
        let mut tasks = self.tasks.lock().await;
        if self.is_running() {
            return Err(PoolError::AlreadyRunning);
        }
        self.ctx.config.validate()?;

        match self.ctx.reclaim_expired().await {
            Ok(recovered) if recovered > 0 => {
                info!(recovered = recovered, "Recovered jobs from expired leases");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Failed to recover expired leases");
            }
        }

        let num_workers = self.ctx.config.num_workers;
        for i in 0..num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                ctx: Arc::clone(&self.ctx),
                shutdown_rx: self.shutdown_tx.subscribe(),
            };
            tasks.push(tokio::spawn(worker.run()));
        }

        let reaper = Reaper {
            ctx: Arc::clone(&self.ctx),
            shutdown_rx: self.shutdown_tx.subscribe(),
        };
        tasks.push(tokio::spawn(reaper.run()));

        self.is_running.store(true, Ordering::SeqCst);
        self.ctx.metrics.update_workers(num_workers);
        info!(
            num_workers = num_workers,
            backend = self.ctx.backend.name(),
            "Worker pool started"
        );

        Ok(())
    }

    /// Gracefully shuts down all workers with the configured timeout.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        self.shutdown_with_timeout(self.ctx.config.shutdown_timeout)
            .await
    }

    /// Sends the shutdown signal and waits up to `timeout` for workers to
    /// finish their current job.
    ///
    /// Workers are never aborted: on timeout they keep running detached until
    /// their render ends. The pool reports itself running until the wait is
    /// over.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop in time.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<(), PoolError> {
        let mut tasks = self.tasks.lock().await;
        if !self.is_running() {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let drain = async {
            for handle in tasks.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };
        let result = tokio::time::timeout(timeout, drain).await;

        self.is_running.store(false, Ordering::SeqCst);
        self.ctx.metrics.update_workers(0);

        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Worker pool shutdown timed out");
                Err(PoolError::ShutdownTimeout(timeout))
            }
        }
    }

    /// Runs one reclamation pass now. Returns the number of reclaimed jobs.
    pub async fn reclaim_expired(&self) -> Result<usize, QueueError> {
        self.ctx.reclaim_expired().await
    }

    pub fn stats(&self) -> PoolStats {
        self.ctx.counters.snapshot(self.ctx.config.num_workers)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn num_workers(&self) -> usize {
        self.ctx.config.num_workers
    }
}

/// Waits for `duration` or the shutdown signal. Returns `true` on shutdown.
async fn sleep_or_shutdown(shutdown_rx: &mut broadcast::Receiver<()>, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        // Ok, Closed and Lagged all mean a shutdown was sent
        _ = shutdown_rx.recv() => true,
    }
}

/// Periodic stuck-job reclamation.
struct Reaper {
    ctx: Arc<PoolContext>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Reaper {
    async fn run(mut self) {
        debug!("Reaper started");

        while !sleep_or_shutdown(&mut self.shutdown_rx, self.ctx.config.reclaim_interval).await {
            match self.ctx.reclaim_expired().await {
                Ok(reclaimed) if reclaimed > 0 => {
                    info!(reclaimed = reclaimed, "Reclaimed jobs from expired leases");
                }
                Ok(_) => {}
                Err(e) => {
                    self.ctx.metrics.record_backend_error("expired_leases");
                    error!(error = %e, "Failed to reclaim expired leases");
                }
            }

            match self.ctx.backend.get_pending_count().await {
                Ok(depth) => self.ctx.metrics.update_queue_depth(self.ctx.backend.name(), depth),
                Err(e) => {
                    self.ctx.metrics.record_backend_error("get_pending_count");
                    debug!(error = %e, "Failed to read queue depth");
                }
            }
        }

        debug!("Reaper stopped");
    }
}

/// One worker task: claim, render, record, repeat.
struct Worker {
    id: String,
    ctx: Arc<PoolContext>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Worker {
    /// Main worker loop.
    ///
    /// Claims and processes one job per iteration until a shutdown signal is
    /// received. A job already claimed is always finished first. Backend
    /// errors are logged and retried with a doubling delay.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        let poll_interval = self.ctx.config.poll_interval;
        let mut error_delay = poll_interval;

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.ctx.backend.dequeue_next().await {
                Ok(Some(job)) => {
                    error_delay = poll_interval;
                    self.process_job(job).await;
                }
                Ok(None) => {
                    error_delay = poll_interval;
                    debug!(worker_id = %self.id, "No jobs available");
                    if sleep_or_shutdown(&mut self.shutdown_rx, poll_interval).await {
                        info!(worker_id = %self.id, "Worker received shutdown signal");
                        break;
                    }
                }
                Err(e) => {
                    self.ctx.metrics.record_backend_error("dequeue_next");
                    error!(
                        worker_id = %self.id,
                        error = %e,
                        retry_in_ms = error_delay.as_millis() as u64,
                        "Failed to dequeue job"
                    );
                    if sleep_or_shutdown(&mut self.shutdown_rx, error_delay).await {
                        break;
                    }
                    error_delay = (error_delay * 2).min(self.ctx.config.backend_retry_max);
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Runs the renderer, turning a panic into a retryable failure.
    async fn render(&self, job: &Job) -> Result<PathBuf, RenderError> {
        let _in_flight = InFlight::enter(&self.ctx);

        match AssertUnwindSafe(self.ctx.renderer.render(&job.payload))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    panic = %message,
                    "Renderer panicked"
                );
                Err(RenderError::failed(format!("renderer panicked: {}", message)))
            }
        }
    }

    /// Renders a claimed job and records the outcome.
    async fn process_job(&self, mut job: Job) {
        let job_id = job.id;
        let start_time = Instant::now();

        info!(
            worker_id = %self.id,
            job_id = %job_id,
            priority = %job.priority,
            attempt = job.retry_count + 1,
            "Processing job"
        );

        self.ctx
            .hooks
            .run_before_generate(&HookContext::new(&job, &self.id));
        let result = self.render(&job).await;
        let duration = start_time.elapsed();

        let now = Utc::now();
        let outcome = match result {
            Ok(path) => {
                if let Err(e) = job.complete(path, now) {
                    error!(worker_id = %self.id, job_id = %job_id, error = %e, "Cannot complete job");
                    return;
                }
                self.ctx
                    .hooks
                    .run_after_generate(&HookContext::new(&job, &self.id));
                info!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    duration_ms = duration.as_millis() as u64,
                    "Job completed successfully"
                );
                JobOutcome::Completed
            }
            Err(render_error) => {
                let message = render_error.to_string();
                let attempt = job.record_failure(
                    &message,
                    render_error.is_retryable(),
                    &self.ctx.retry_policy,
                    now,
                );
                match attempt {
                    Ok(AttemptOutcome::Retry { delay }) => {
                        warn!(
                            worker_id = %self.id,
                            job_id = %job_id,
                            error = %message,
                            retry_count = job.retry_count,
                            remaining_retries = job.remaining_retries(),
                            retry_in_ms = delay.as_millis() as u64,
                            "Job failed, scheduled for retry"
                        );
                        JobOutcome::Retried
                    }
                    Ok(AttemptOutcome::Failed) => {
                        error!(
                            worker_id = %self.id,
                            job_id = %job_id,
                            error = %message,
                            retry_count = job.retry_count,
                            "Job failed permanently"
                        );
                        self.ctx
                            .hooks
                            .run_on_error(&message, &HookContext::new(&job, &self.id));
                        JobOutcome::Failed
                    }
                    Err(e) => {
                        error!(worker_id = %self.id, job_id = %job_id, error = %e, "Cannot record failure");
                        return;
                    }
                }
            }
        };

        if self.persist(&job).await {
            self.ctx.counters.record(outcome, duration);
            self.ctx
                .metrics
                .record_job(outcome, job.priority, duration.as_secs_f64());
        }
    }

    /// Writes the job back, retrying connectivity failures with backoff.
    ///
    /// Gives up once the lease would have expired anyway; by then the job is
    /// reclaimed and the result is stale. Returns whether the write landed.
    async fn persist(&self, job: &Job) -> bool {
        let started = Instant::now();
        let mut delay = self.ctx.config.poll_interval;

        loop {
            match self.ctx.backend.update_job(job).await {
                Ok(()) => return true,
                Err(QueueError::LeaseMismatch(_)) | Err(QueueError::InvalidTransition { .. }) => {
                    warn!(
                        worker_id = %self.id,
                        job_id = %job.id,
                        "Job was reclaimed before its result was saved, dropping result"
                    );
                    return false;
                }
                Err(e) if e.is_backend_unavailable()
                    && started.elapsed() + delay < self.ctx.config.visibility_timeout =>
                {
                    self.ctx.metrics.record_backend_error("update_job");
                    error!(
                        worker_id = %self.id,
                        job_id = %job.id,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to save job, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.ctx.config.backend_retry_max);
                }
                Err(e) => {
                    self.ctx.metrics.record_backend_error("update_job");
                    error!(worker_id = %self.id, job_id = %job.id, error = %e, "Failed to save job");
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::backend::MemoryBackend;
    use crate::scheduler::job::{JobPriority, JobStatus, Lease, RenderPayload};
    use async_trait::async_trait;

    struct EchoRenderer;

    #[async_trait]
    impl Renderer for EchoRenderer {
        async fn render(&self, payload: &RenderPayload) -> Result<PathBuf, RenderError> {
            Ok(PathBuf::from("/out").join(&payload.output_filename))
        }
    }

    struct PanickingRenderer;

    #[async_trait]
    impl Renderer for PanickingRenderer {
        async fn render(&self, _payload: &RenderPayload) -> Result<PathBuf, RenderError> {
            panic!("font cache corrupted")
        }
    }

    fn job() -> Job {
        Job::new(
            RenderPayload::new("t", serde_json::json!({"k": "v"}), "out.pdf"),
            JobPriority::Normal,
        )
    }

    async fn wait_until_terminal(backend: &MemoryBackend, id: uuid::Uuid) -> Job {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let stored = backend.get_job(id).await.unwrap().unwrap();
            if stored.status.is_terminal() {
                return stored;
            }
            assert!(Instant::now() < deadline, "job never finished");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();

        assert_eq!(config.num_workers, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.visibility_timeout, Duration::from_secs(300));
        assert_eq!(config.reclaim_interval, Duration::from_secs(5));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
        assert_eq!(config.backend_retry_max, Duration::from_secs(30));
    }

    #[test]
    fn test_worker_pool_config_validate() {
        assert!(WorkerPoolConfig::default().validate().is_ok());
        assert!(WorkerPoolConfig::new(0).validate().is_err());
        assert!(WorkerPoolConfig::new(1)
            .with_poll_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(WorkerPoolConfig::new(1)
            .with_visibility_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_counters_snapshot() {
        let counters = Counters::default();

        counters.record(JobOutcome::Completed, Duration::from_secs(10));
        counters.record(JobOutcome::Completed, Duration::from_secs(20));
        counters.record(JobOutcome::Failed, Duration::from_secs(5));
        counters.record(JobOutcome::Retried, Duration::from_secs(1));
        counters.reclaimed.fetch_add(1, Ordering::SeqCst);

        let stats = counters.snapshot(4);

        assert_eq!(stats.num_workers, 4);
        assert_eq!(stats.active_workers, 0);
        assert_eq!(stats.jobs_completed, 2);
        assert_eq!(stats.jobs_failed, 1);
        assert_eq!(stats.jobs_retried, 1);
        assert_eq!(stats.jobs_reclaimed, 1);
        // (10000 + 20000 + 5000 + 1000) / 4
        assert_eq!(stats.average_render, Duration::from_millis(9000));
        assert_eq!(Counters::default().snapshot(1).average_render, Duration::ZERO);
    }

    #[test]
    fn test_pool_error_display() {
        assert!(PoolError::AlreadyRunning.to_string().contains("already running"));
        assert!(PoolError::NotRunning.to_string().contains("not running"));
        assert!(PoolError::ShutdownTimeout(Duration::from_secs(60))
            .to_string()
            .contains("60"));
        assert!(PoolError::InvalidConfig("num_workers".to_string())
            .to_string()
            .contains("num_workers"));
    }

    #[tokio::test]
    async fn test_pool_lifecycle() {
        let backend = Arc::new(MemoryBackend::new());
        let config = WorkerPoolConfig::new(2).with_poll_interval(Duration::from_millis(10));
        let pool = WorkerPool::new(config, backend.clone(), Arc::new(EchoRenderer));

        let job = job();
        let id = job.id;
        backend.enqueue(job).await.unwrap();

        pool.start().await.unwrap();
        assert!(pool.is_running());
        assert!(matches!(pool.start().await, Err(PoolError::AlreadyRunning)));

        let stored = wait_until_terminal(&backend, id).await;
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.result_path, Some(PathBuf::from("/out/out.pdf")));
        assert!(stored.lease.is_none());

        pool.shutdown().await.unwrap();
        assert!(!pool.is_running());
        assert!(matches!(pool.shutdown().await, Err(PoolError::NotRunning)));
        assert_eq!(pool.stats().jobs_completed, 1);
    }

    #[tokio::test]
    async fn test_renderer_panic_is_a_retryable_failure() {
        let backend = Arc::new(MemoryBackend::new());
        let config = WorkerPoolConfig::new(1).with_poll_interval(Duration::from_millis(10));
        let pool = WorkerPool::with_parts(
            config,
            backend.clone(),
            Arc::new(PanickingRenderer),
            Arc::new(HookRegistry::default()),
            RetryPolicy::immediate(),
        );

        let job = job().with_max_retries(2);
        let id = job.id;
        backend.enqueue(job).await.unwrap();
        pool.start().await.unwrap();

        let stored = wait_until_terminal(&backend, id).await;
        pool.shutdown().await.unwrap();

        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, 2);
        assert!(stored.error.unwrap().contains("font cache corrupted"));

        let stats = pool.stats();
        assert_eq!(stats.active_workers, 0);
        assert_eq!(stats.jobs_retried, 1);
        assert_eq!(stats.jobs_failed, 1);
    }

    #[tokio::test]
    async fn test_reclaim_expired_lease() {
        let backend = Arc::new(MemoryBackend::new());
        let config = WorkerPoolConfig::new(1).with_visibility_timeout(Duration::from_secs(60));
        let pool = WorkerPool::with_parts(
            config,
            backend.clone(),
            Arc::new(EchoRenderer),
            Arc::new(HookRegistry::default()),
            RetryPolicy::immediate(),
        );

        backend.enqueue(job()).await.unwrap();
        let mut claimed = backend.dequeue_next().await.unwrap().unwrap();

        // Nothing has expired yet.
        assert_eq!(pool.reclaim_expired().await.unwrap(), 0);

        // Pretend the claim happened long ago.
        let old = Lease {
            claimed_at: Utc::now() - chrono::Duration::seconds(120),
            ..claimed.lease.clone().unwrap()
        };
        claimed.lease = Some(old);
        backend.update_job(&claimed).await.unwrap();

        assert_eq!(pool.reclaim_expired().await.unwrap(), 1);

        let stored = backend.get_job(claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(pool.stats().jobs_reclaimed, 1);
    }
}
